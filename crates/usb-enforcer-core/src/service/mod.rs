//! Remote API and secrets-channel request handling.

pub mod protocol;

#[cfg(test)]
mod tests;

use crate::channel::SecretSubmission;
use crate::context::{EnforcerContext, Platform};
use crate::crypto::{self, CryptoEngine, EncryptOptions};
use crate::device::{Device, DeviceSummary};
use crate::enforcement::EnforcementEngine;
use crate::error::{EnforcerError, EnforcerResult};
use crate::events::EnforcerEvent;
use crate::operation::{OperationId, OperationKind, OperationOutcome};
use crate::secrets::SecretBytes;
use log::{debug, info, warn};
use protocol::{ApiRequest, ApiResponse};
use std::sync::Arc;
use std::thread;
use tokio::sync::broadcast;

/// Front door for clients: queries, passphrase submission, and operation
/// requests. Cheap to clone.
pub struct EnforcerService<P: Platform> {
    engine: Arc<EnforcementEngine<P>>,
    crypto: Arc<CryptoEngine<P>>,
}

impl<P: Platform> Clone for EnforcerService<P> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            crypto: self.crypto.clone(),
        }
    }
}

impl<P: Platform> EnforcerService<P> {
    pub fn new(engine: Arc<EnforcementEngine<P>>) -> Self {
        let crypto = Arc::new(CryptoEngine::new(engine.clone()));
        Self { engine, crypto }
    }

    pub fn engine(&self) -> &Arc<EnforcementEngine<P>> {
        &self.engine
    }

    fn ctx(&self) -> &Arc<EnforcerContext<P>> {
        self.engine.context()
    }

    pub fn list_devices(&self) -> Vec<DeviceSummary> {
        let registry = self.ctx().registry();
        let operations = self.ctx().operations();
        registry
            .summaries()
            .into_iter()
            .map(|mut summary| {
                summary.operation = operations.get(&summary.path).map(|op| op.summary());
                summary
            })
            .collect()
    }

    pub fn device_status(&self, path: &str) -> EnforcerResult<DeviceSummary> {
        let registry = self.ctx().registry();
        let device = registry
            .get(path)
            .ok_or_else(|| EnforcerError::DeviceNotFound(path.to_string()))?;
        let mut summary = device.summary();
        summary.operation = self.ctx().operations().get(path).map(|op| op.summary());
        Ok(summary)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnforcerEvent> {
        self.ctx().events.subscribe()
    }

    /// Park a passphrase and return its token id.
    ///
    /// Encrypt submissions shorter than the configured minimum are refused
    /// before any token exists.
    pub fn submit_secret(&self, submission: SecretSubmission) -> EnforcerResult<String> {
        let cfg = self.ctx().config();
        if submission.passphrase.is_empty() {
            return Err(EnforcerError::PassphraseTooShort {
                min: cfg.encryption.min_passphrase_length.max(1),
                got: 0,
            });
        }
        if submission.kind == OperationKind::Encrypt {
            crypto::check_passphrase(&cfg, &submission.passphrase)?;
        }
        let token = self.ctx().tokens().issue(
            &submission.device,
            submission.kind,
            submission.passphrase,
            cfg.token_ttl(),
        );
        info!(
            "issued {} token for {} (ttl {}s)",
            submission.kind, submission.device, cfg.secrets.token_ttl_secs
        );
        Ok(token)
    }

    /// Scrub expired tokens; returns how many were dropped.
    pub fn purge_tokens(&self) -> usize {
        let purged = self.ctx().tokens().purge_expired();
        if purged > 0 {
            debug!("reaped {purged} expired tokens");
        }
        purged
    }

    pub fn request_unlock(&self, path: &str, token: &str) -> EnforcerResult<OperationId> {
        self.request(path, token, OperationKind::Unlock, EncryptOptions::default())
    }

    pub fn request_encrypt(
        &self,
        path: &str,
        token: &str,
        options: EncryptOptions,
    ) -> EnforcerResult<OperationId> {
        self.request(path, token, OperationKind::Encrypt, options)
    }

    fn request(
        &self,
        path: &str,
        token: &str,
        kind: OperationKind,
        options: EncryptOptions,
    ) -> EnforcerResult<OperationId> {
        let cfg = self.ctx().config();
        let device = {
            let registry = self.ctx().registry();
            let device = registry
                .get(path)
                .cloned()
                .ok_or_else(|| EnforcerError::DeviceNotFound(path.to_string()))?;
            if self.ctx().operations().contains(path) {
                return Err(EnforcerError::OperationInProgress(path.to_string()));
            }
            device
        };

        let eligibility = match kind {
            OperationKind::Encrypt => crypto::encrypt_eligibility(&device, &options),
            OperationKind::Unlock => crypto::unlock_eligibility(&cfg, &device),
        };
        eligibility.map_err(|reason| EnforcerError::Ineligible {
            path: path.to_string(),
            reason,
        })?;

        // Redeemed under the registry and operation locks so a request that
        // loses the race for `path` leaves its token pending.
        let (id, secret) = self.engine.begin_operation_with(path, kind, || {
            self.ctx()
                .tokens()
                .redeem(token, path, kind)
                .map_err(EnforcerError::from)
        })?;
        self.spawn_worker(id.clone(), kind, device, secret, options)?;
        Ok(id)
    }

    fn spawn_worker(
        &self,
        id: OperationId,
        kind: OperationKind,
        device: Device,
        secret: SecretBytes,
        options: EncryptOptions,
    ) -> EnforcerResult<()> {
        let engine = self.engine.clone();
        let crypto = self.crypto.clone();
        let worker_id = id.clone();
        let spawned = thread::Builder::new()
            .name(format!("{kind}-{}", device.path()))
            .spawn(move || {
                let result = match kind {
                    OperationKind::Encrypt => crypto.encrypt(&worker_id, &device, &secret, &options),
                    OperationKind::Unlock => crypto.unlock(&worker_id, &device, &secret),
                };
                drop(secret);
                let outcome = OperationOutcome::from_result(&result, kind.first_phase());
                engine.operation_ended(&worker_id, outcome);
            });

        if let Err(err) = spawned {
            warn!("failed to start worker for operation {id}: {err}");
            self.engine.operation_ended(
                &id,
                OperationOutcome::Failed {
                    phase: kind.first_phase(),
                    message: format!("worker could not start: {err}"),
                },
            );
            return Err(err.into());
        }
        Ok(())
    }

    /// Answer one request. `Subscribe` is acknowledged here; streaming is the
    /// transport's job.
    pub fn handle(&self, request: ApiRequest) -> ApiResponse {
        let result = match request {
            ApiRequest::ListDevices => Ok(ApiResponse::Devices {
                devices: self.list_devices(),
            }),
            ApiRequest::GetDeviceStatus { path } => self
                .device_status(&path)
                .map(|device| ApiResponse::Device { device }),
            ApiRequest::RequestUnlock { path, token } => self
                .request_unlock(&path, &token)
                .map(|operation_id| ApiResponse::Operation { operation_id }),
            ApiRequest::RequestEncrypt {
                path,
                token,
                options,
            } => self
                .request_encrypt(&path, &token, options)
                .map(|operation_id| ApiResponse::Operation { operation_id }),
            ApiRequest::Subscribe => Ok(ApiResponse::Subscribed),
            ApiRequest::Ping => Ok(ApiResponse::Pong {
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        };
        result.unwrap_or_else(|err| {
            debug!("request rejected: {err}");
            ApiResponse::error(&err)
        })
    }
}
