//! Process-wide shared state handed to every component at construction.

use crate::config::{ConfigStore, EnforcerConfig};
use crate::error::EnforcerError;
use crate::events::EventBus;
use crate::operation::OperationTable;
use crate::registry::DeviceRegistry;
use crate::secrets::TokenTable;
use std::sync::{Arc, Mutex, MutexGuard};
use usb_enforcer_provider::{BlockControl, CryptTooling, DeviceProbe, SessionProbe};

/// Everything the daemon needs from the host, with errors already mapped into
/// [`EnforcerError`].
pub trait Platform:
    BlockControl<Error = EnforcerError>
    + CryptTooling<Error = EnforcerError>
    + SessionProbe<Error = EnforcerError>
    + DeviceProbe<Error = EnforcerError>
    + Send
    + Sync
    + 'static
{
}

impl<T> Platform for T where
    T: BlockControl<Error = EnforcerError>
        + CryptTooling<Error = EnforcerError>
        + SessionProbe<Error = EnforcerError>
        + DeviceProbe<Error = EnforcerError>
        + Send
        + Sync
        + 'static
{
}

/// Shared tables, each behind its own lock.
///
/// When more than one table is needed the locks are taken in the order
/// registry, operations, tokens. No external command runs while any of them
/// is held.
pub struct EnforcerContext<P: Platform> {
    pub config: ConfigStore,
    pub events: EventBus,
    pub platform: Arc<P>,
    registry: Mutex<DeviceRegistry>,
    operations: Mutex<OperationTable>,
    tokens: Mutex<TokenTable>,
}

impl<P: Platform> EnforcerContext<P> {
    pub fn new(config: EnforcerConfig, platform: Arc<P>) -> Arc<Self> {
        let events = EventBus::new(config.api.event_buffer);
        Arc::new(Self {
            config: ConfigStore::new(config),
            events,
            platform,
            registry: Mutex::new(DeviceRegistry::new()),
            operations: Mutex::new(OperationTable::new()),
            tokens: Mutex::new(TokenTable::new()),
        })
    }

    pub fn config(&self) -> Arc<EnforcerConfig> {
        self.config.snapshot()
    }

    pub fn registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        self.registry.lock().expect("device registry lock poisoned")
    }

    pub fn operations(&self) -> MutexGuard<'_, OperationTable> {
        self.operations.lock().expect("operation table lock poisoned")
    }

    pub fn tokens(&self) -> MutexGuard<'_, TokenTable> {
        self.tokens.lock().expect("token table lock poisoned")
    }
}
