//! Version information for p2pool-sidecar.

/// Sidecar version from Cargo.toml
pub const SIDECAR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `User-Agent` header value sent on every request to the pool process.
pub fn user_agent() -> String {
    format!("p2pool-sidecar/{}", SIDECAR_VERSION)
}
