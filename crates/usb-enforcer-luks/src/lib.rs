#![forbid(unsafe_code)]

//! Host implementation of the enforcer's platform contracts.
//!
//! Every operation shells out to a standard utility:
//! - `blockdev` for the kernel read-only flag
//! - `cryptsetup`, `mkfs.*`, `blkid`, `mount`, `umount` for the crypto workflows
//! - `loginctl` and `id` for session group lookup

mod command;
mod mounts;
mod system;

pub use mounts::MOUNTS_OVERRIDE_ENV;
pub use system::SystemTooling;
