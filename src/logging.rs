//! Process-wide debug switch and subscriber setup.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static DEBUG: OnceLock<bool> = OnceLock::new();

/// Turn PDU tracing on or off. Only the first call takes effect; returns
/// whether this call set the flag.
pub fn set_debug(enabled: bool) -> bool {
    DEBUG.set(enabled).is_ok()
}

pub fn is_debug() -> bool {
    DEBUG.get().copied().unwrap_or(false)
}

/// Install a `fmt` subscriber. `RUST_LOG` overrides the default filter.
/// Does nothing if a global subscriber is already set.
pub fn init() {
    let level = if is_debug() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ldap_session={},info", level)));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
