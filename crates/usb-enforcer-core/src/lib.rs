//! Core of the USB enforcement daemon.
//!
//! Classification, policy, workflows, and the client-facing services live here
//! so the daemon binary only has to wire up sockets, udev, and signals.

pub mod channel;
pub mod config;
pub mod context;
pub mod crypto;
pub mod device;
pub mod enforcement;
pub mod error;
pub mod events;
pub mod logging;
pub mod monitor;
pub mod operation;
pub mod privilege;
pub mod registry;
pub mod retry;
pub mod secrets;
pub mod service;

#[cfg(test)]
pub(crate) mod fake;

pub use config::{ConfigFormat, ConfigStore, EnforcerConfig};
pub use context::{EnforcerContext, Platform};
pub use crypto::{CryptoEngine, EncryptOptions};
pub use device::{classify, Device, DeviceClass, DeviceSummary, EnforcementState};
pub use enforcement::EnforcementEngine;
pub use error::{EnforcerError, EnforcerResult, TokenError};
pub use events::{EnforcerEvent, EventBus, EventType};
pub use monitor::{run_event_loop, DeviceEvent};
pub use operation::{OperationId, OperationKind, Phase};
pub use secrets::SecretBytes;
pub use service::protocol::{ApiRequest, ApiResponse, ErrorKind};
pub use service::EnforcerService;
