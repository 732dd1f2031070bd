//! Privilege checks for the daemon.

use crate::error::{EnforcerError, EnforcerResult};

/// Block-device flags, dm-crypt, and mounts all need root.
pub fn ensure_root() -> EnforcerResult<()> {
    if running_as_root() {
        Ok(())
    } else {
        Err(EnforcerError::Privilege(
            "the USB enforcer daemon must run as root; start it from the system service manager".into(),
        ))
    }
}

pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
