//! Provider contract for the block-level read-only switch.

use std::error::Error;

/// Toggles the kernel read-only flag on a block device node.
pub trait BlockControl {
    type Error: Error + Send + Sync + 'static;

    /// Set (`true`) or clear (`false`) the read-only flag for `device`.
    ///
    /// Implementations should surface a transient "device busy" condition as a
    /// distinguishable error so callers can retry with backoff.
    fn set_read_only(&self, device: &str, read_only: bool) -> Result<(), Self::Error>;

    /// Report the current read-only flag for `device`.
    fn is_read_only(&self, device: &str) -> Result<bool, Self::Error>;
}
