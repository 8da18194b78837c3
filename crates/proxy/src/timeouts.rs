/// Default call timeout (seconds) when no env override is provided.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

/// Parse a positive (`> 0`) u64 env var.
fn read_positive_u64_env(var: &str) -> Option<u64> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}

/// Global maximum allowed budget for one proxied call (seconds).
///
/// Env: `MCP_PROXY_CALL_TIMEOUT_MAX_SECS`.
#[must_use]
pub fn call_timeout_max_secs() -> u64 {
    read_positive_u64_env("MCP_PROXY_CALL_TIMEOUT_MAX_SECS").unwrap_or(DEFAULT_CALL_TIMEOUT_SECS)
}

/// Default call budget when neither the config file nor the CLI sets one (seconds).
///
/// The returned value is always clamped to `call_timeout_max_secs()`.
#[must_use]
pub fn call_timeout_default_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS.min(call_timeout_max_secs()).max(1)
}
