#![forbid(unsafe_code)]

//! Platform contracts shared across the USB enforcer.
//!
//! The core crate drives policy and workflows against these traits; concrete
//! system integrations (udev, `cryptsetup`, `blockdev`, ...) live in their own
//! crates so the rest of the workspace stays testable.

pub mod block;
pub mod crypt;
pub mod device;
pub mod session;

pub use block::BlockControl;
pub use crypt::{CryptTooling, FilesystemType, KdfKind, LuksFormatParams, LuksVersion};
pub use device::{DevType, DeviceProbe, DeviceProperties};
pub use session::SessionProbe;
