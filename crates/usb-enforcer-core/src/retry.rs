//! Bounded exponential backoff for transient device failures.

use crate::config::RetryCfg;
use crate::error::EnforcerResult;
use log::debug;
use rand::Rng;
use std::thread;
use std::time::Duration;

/// Delay before retry number `attempt` (1-based), capped and jittered.
pub fn backoff_delay(cfg: &RetryCfg, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = cfg.base_delay_ms.saturating_mul(1u64 << exp);
    let capped = base.min(cfg.max_delay_ms.max(cfg.base_delay_ms));
    let jitter = (capped as f64 * cfg.jitter_ratio.clamp(0.0, 1.0)) as u64;
    let offset = if jitter == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter)
    };
    Duration::from_millis(capped.saturating_sub(jitter / 2) + offset)
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub fn retry_transient<T, F>(cfg: &RetryCfg, what: &str, mut op: F) -> EnforcerResult<T>
where
    F: FnMut() -> EnforcerResult<T>,
{
    let attempts = cfg.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = backoff_delay(cfg, attempt);
                debug!("{what}: attempt {attempt}/{attempts} hit {err}; retrying in {delay:?}");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
