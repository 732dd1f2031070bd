//! Policy engine: decides and applies block-level enforcement per device.

use crate::config::EnforcerConfig;
use crate::context::{EnforcerContext, Platform};
use crate::device::{classify, unsupported_reason, Device, DeviceClass, EnforcementState};
use crate::error::{EnforcerError, EnforcerResult};
use crate::events::EventType;
use crate::operation::{Operation, OperationId, OperationKind, OperationOutcome, Phase};
use crate::retry::retry_transient;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use usb_enforcer_provider::DeviceProperties;

/// Target state for a device of `class`.
///
/// An active operation always wins so the engine never fights a workflow.
pub fn decide(class: DeviceClass, has_operation: bool, exempt: bool) -> EnforcementState {
    if has_operation {
        return EnforcementState::Suspended;
    }
    match class {
        DeviceClass::Mapper | DeviceClass::Luks2 => EnforcementState::WriteAllowed,
        DeviceClass::Luks1 => EnforcementState::ReadOnlyEnforced,
        DeviceClass::PlaintextPartition | DeviceClass::PlaintextDisk => {
            if exempt {
                EnforcementState::Exempt
            } else {
                EnforcementState::ReadOnlyEnforced
            }
        }
        DeviceClass::NonUsb | DeviceClass::Unsupported => EnforcementState::Unmonitored,
    }
}

/// Block-level action implied by a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockAction {
    SetReadOnly,
    ClearReadOnly,
    Leave,
}

fn block_action(class: DeviceClass, state: EnforcementState) -> BlockAction {
    match state {
        EnforcementState::ReadOnlyEnforced => BlockAction::SetReadOnly,
        EnforcementState::Exempt => BlockAction::ClearReadOnly,
        EnforcementState::WriteAllowed => match class {
            DeviceClass::Luks2 => BlockAction::ClearReadOnly,
            DeviceClass::Mapper
            | DeviceClass::Luks1
            | DeviceClass::PlaintextPartition
            | DeviceClass::PlaintextDisk
            | DeviceClass::NonUsb
            | DeviceClass::Unsupported => BlockAction::Leave,
        },
        EnforcementState::Unmonitored | EnforcementState::Suspended => BlockAction::Leave,
    }
}

pub struct EnforcementEngine<P: Platform> {
    ctx: Arc<EnforcerContext<P>>,
    /// Serialises evaluate-and-apply against operation start for the same device.
    apply: Mutex<()>,
}

impl<P: Platform> EnforcementEngine<P> {
    pub fn new(ctx: Arc<EnforcerContext<P>>) -> Self {
        Self {
            ctx,
            apply: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &Arc<EnforcerContext<P>> {
        &self.ctx
    }

    /// Classify a new or changed device and bring its block state in line.
    pub fn device_added(&self, props: DeviceProperties) -> EnforcerResult<EnforcementState> {
        let cfg = self.ctx.config();
        let props = self.inherit_bus(props);
        let path = props.path.clone();
        let class = classify(&props, cfg.policy.enforce_on_usb_only);
        if class == DeviceClass::Unsupported {
            debug!("{path} left unmonitored: {}", unsupported_reason(&props));
        }
        // Session lookups spawn tools; keep them outside the apply lock.
        let exempt = class.is_plaintext() && self.session_exempt(&cfg);

        let _apply = self.apply.lock().expect("enforcement apply lock poisoned");

        {
            let mut registry = self.ctx.registry();
            let operations = self.ctx.operations();
            if operations.contains(&path) {
                let fresh = !registry.contains(&path);
                let mountpoint = registry.get(&path).and_then(|d| d.mountpoint.clone());
                let mut device = Device::new(props, class, EnforcementState::Suspended);
                device.mountpoint = mountpoint;
                registry.upsert(device);
                drop(operations);
                drop(registry);
                info!("{path} has an active operation; enforcement suspended");
                if fresh {
                    self.ctx
                        .events
                        .publish(&path, EventType::Added, class.to_string());
                }
                return Ok(EnforcementState::Suspended);
            }
        }

        let state = decide(class, false, exempt);
        let applied = self.apply_block_state(&path, class, state, &cfg);

        let mut registry = self.ctx.registry();
        let previous = registry.get(&path).cloned();
        match applied {
            Ok(action) => {
                let mut device = Device::new(props, class, state);
                device.mountpoint = previous.as_ref().and_then(|d| d.mountpoint.clone());
                registry.upsert(device);
                drop(registry);

                match &previous {
                    None => self
                        .ctx
                        .events
                        .publish(&path, EventType::Added, class.to_string()),
                    Some(prev) if prev.state != state => self.ctx.events.publish(
                        &path,
                        EventType::StateChanged,
                        format!("{} -> {}", prev.state, state),
                    ),
                    Some(_) => {}
                }
                if action != BlockAction::Leave {
                    self.ctx
                        .events
                        .publish(&path, EventType::EnforcementApplied, state.to_string());
                }
                info!("{path} classified {class}, state {state}");
                Ok(state)
            }
            Err(err) => {
                let fallback = previous
                    .as_ref()
                    .map(|d| d.state)
                    .unwrap_or(EnforcementState::Unmonitored);
                let mut device = Device::new(props, class, fallback);
                device.mountpoint = previous.as_ref().and_then(|d| d.mountpoint.clone());
                registry.upsert(device);
                drop(registry);

                if previous.is_none() {
                    self.ctx
                        .events
                        .publish(&path, EventType::Added, class.to_string());
                }
                warn!("failed to enforce {state} on {path}: {err}");
                self.ctx
                    .events
                    .publish(&path, EventType::EnforcementFailed, err.to_string());
                Err(EnforcerError::Enforcement {
                    path,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Forget a vanished device; an operation on it is flagged aborted.
    pub fn device_removed(&self, path: &str) {
        let mut registry = self.ctx.registry();
        let removed = registry.remove(path);
        let aborted = self.ctx.operations().mark_aborted(path);
        drop(registry);

        if removed.is_some() {
            info!("{path} removed");
            self.ctx.events.publish(path, EventType::Removed, "");
        }
        if let Some(id) = aborted {
            warn!("{path} removed during operation {id}; marked aborted");
            self.ctx
                .events
                .publish(path, EventType::OperationAborted, id.to_string());
        }
    }

    /// Register an operation and force the device to `Suspended`.
    ///
    /// Must complete before any destructive call against the device.
    pub fn begin_operation(&self, path: &str, kind: OperationKind) -> EnforcerResult<OperationId> {
        self.begin_operation_with(path, kind, || Ok(()))
            .map(|(id, ())| id)
    }

    /// Like [`begin_operation`](Self::begin_operation), but runs `claim` while
    /// the registry and operation table are still held. The operation is
    /// withdrawn again when `claim` fails, and the device is left as it was.
    pub fn begin_operation_with<T>(
        &self,
        path: &str,
        kind: OperationKind,
        claim: impl FnOnce() -> EnforcerResult<T>,
    ) -> EnforcerResult<(OperationId, T)> {
        let _apply = self.apply.lock().expect("enforcement apply lock poisoned");
        let mut registry = self.ctx.registry();
        if !registry.contains(path) {
            return Err(EnforcerError::DeviceNotFound(path.to_string()));
        }
        let mut operations = self.ctx.operations();
        let id = operations.insert(Operation::new(path, kind))?;
        let claimed = match claim() {
            Ok(claimed) => claimed,
            Err(err) => {
                operations.finish(&id);
                return Err(err);
            }
        };
        let previous = registry.set_state(path, EnforcementState::Suspended);
        drop(operations);
        drop(registry);

        info!("{kind} operation {id} started on {path}");
        self.ctx
            .events
            .publish(path, EventType::OperationStarted, format!("{kind} {id}"));
        if previous != Some(EnforcementState::Suspended) {
            self.ctx.events.publish(
                path,
                EventType::StateChanged,
                format!(
                    "{} -> {}",
                    previous.unwrap_or(EnforcementState::Unmonitored),
                    EnforcementState::Suspended
                ),
            );
        }
        Ok((id, claimed))
    }

    pub fn enter_phase(&self, id: &OperationId, phase: Phase) {
        let path = self.ctx.operations().set_phase(id, phase);
        if let Some(path) = path {
            debug!("operation {id} on {path}: {phase}");
            self.ctx
                .events
                .publish(&path, EventType::OperationPhase, phase.to_string());
        }
    }

    pub fn record_staging(&self, id: &OperationId, staging: Option<PathBuf>) {
        self.ctx.operations().set_staging(id, staging);
    }

    pub fn is_aborted(&self, id: &OperationId) -> bool {
        let operations = self.ctx.operations();
        operations
            .get_by_id(id)
            .map(|op| op.aborted)
            .unwrap_or(false)
    }

    /// Close out an operation and re-evaluate the device from fresh properties.
    pub fn operation_ended(&self, id: &OperationId, outcome: OperationOutcome) {
        let finished = self.ctx.operations().finish(id);
        let Some(op) = finished else {
            warn!("operation {id} ended but was not registered");
            return;
        };
        let path = op.path.clone();

        match &outcome {
            OperationOutcome::Succeeded { mountpoint } => {
                info!("{} operation {id} on {path} completed", op.kind);
                self.ctx.events.publish(
                    &path,
                    EventType::OperationCompleted,
                    mountpoint.clone().unwrap_or_default(),
                );
            }
            OperationOutcome::Failed { phase, message } => {
                warn!("{} operation {id} on {path} failed in {phase}: {message}", op.kind);
                self.ctx.events.publish(
                    &path,
                    EventType::OperationFailed,
                    format!("{phase}: {message}"),
                );
            }
        }

        {
            let mut registry = self.ctx.registry();
            if let Some(device) = registry.get_mut(&path) {
                device.mountpoint = match &outcome {
                    OperationOutcome::Succeeded { mountpoint } => mountpoint.clone(),
                    OperationOutcome::Failed { .. } => None,
                };
            }
        }

        let fresh = match self.ctx.platform.probe(&path) {
            Ok(found) => found,
            Err(err) => {
                warn!("re-probing {path} failed: {err}; reusing last known properties");
                self.ctx.registry().get(&path).map(|d| d.props.clone())
            }
        };

        match fresh {
            Some(props) => {
                if let Err(err) = self.device_added(props) {
                    warn!("re-evaluation of {path} after operation {id} failed: {err}");
                }
            }
            None => {
                if op.aborted {
                    debug!("{path} is gone after aborted operation {id}");
                }
                self.device_removed(&path);
            }
        }
    }

    fn inherit_bus(&self, mut props: DeviceProperties) -> DeviceProperties {
        if props.is_mapper && props.bus.is_none() {
            if let Some(parent) = props.parent.as_deref() {
                props.bus = self
                    .ctx
                    .registry()
                    .get(parent)
                    .and_then(|d| d.props.bus.clone());
            }
        }
        props
    }

    fn session_exempt(&self, cfg: &EnforcerConfig) -> bool {
        if cfg.policy.exempted_groups.is_empty() {
            return false;
        }
        match self.ctx.platform.active_user_groups() {
            Ok(groups) => cfg.is_exempt(&groups),
            Err(err) => {
                warn!("unable to resolve active session groups: {err}");
                false
            }
        }
    }

    fn apply_block_state(
        &self,
        path: &str,
        class: DeviceClass,
        state: EnforcementState,
        cfg: &EnforcerConfig,
    ) -> EnforcerResult<BlockAction> {
        let action = block_action(class, state);
        let read_only = match action {
            BlockAction::Leave => return Ok(action),
            BlockAction::SetReadOnly => true,
            BlockAction::ClearReadOnly => false,
        };
        let platform = &self.ctx.platform;
        retry_transient(&cfg.retry, &format!("set read-only={read_only} on {path}"), || {
            platform.set_read_only(path, read_only)
        })?;
        if platform.is_read_only(path)? != read_only {
            return Err(EnforcerError::Enforcement {
                path: path.to_string(),
                reason: format!("read-only flag did not change to {read_only}"),
            });
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_operation_always_suspends() {
        for class in [
            DeviceClass::PlaintextPartition,
            DeviceClass::PlaintextDisk,
            DeviceClass::Luks1,
            DeviceClass::Luks2,
            DeviceClass::Mapper,
            DeviceClass::NonUsb,
            DeviceClass::Unsupported,
        ] {
            assert_eq!(decide(class, true, false), EnforcementState::Suspended);
            assert_eq!(decide(class, true, true), EnforcementState::Suspended);
        }
    }

    #[test]
    fn plaintext_is_read_only_unless_exempt() {
        assert_eq!(
            decide(DeviceClass::PlaintextPartition, false, false),
            EnforcementState::ReadOnlyEnforced
        );
        assert_eq!(
            decide(DeviceClass::PlaintextDisk, false, true),
            EnforcementState::Exempt
        );
    }

    #[test]
    fn exemption_only_affects_plaintext() {
        assert_eq!(
            decide(DeviceClass::Luks1, false, true),
            EnforcementState::ReadOnlyEnforced
        );
        assert_eq!(
            decide(DeviceClass::Unsupported, false, true),
            EnforcementState::Unmonitored
        );
    }

    #[test]
    fn luks2_clears_read_only_but_mapper_is_untouched() {
        assert_eq!(
            block_action(DeviceClass::Luks2, EnforcementState::WriteAllowed),
            BlockAction::ClearReadOnly
        );
        assert_eq!(
            block_action(DeviceClass::Mapper, EnforcementState::WriteAllowed),
            BlockAction::Leave
        );
        assert_eq!(
            block_action(DeviceClass::PlaintextPartition, EnforcementState::Suspended),
            BlockAction::Leave
        );
    }
}
