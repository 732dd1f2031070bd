//! Logging bootstrap for enforcer binaries.

use env_logger::{Builder, Env};
use std::io::Write;

/// Install the global logger once, honouring `RUST_LOG` over `default_level`.
pub fn init(default_level: &str) {
    let env = Env::default().default_filter_or(default_level);
    let _ = Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {}: {}",
                buf.timestamp_seconds(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
