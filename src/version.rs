// Centralized version information

// Protocol revision spoken by the receiver
pub const PROTOCOL_VERSION: &str = "UPD8/1";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

// Full version string including protocol revision
pub fn full_version() -> String {
    format!("v{} ({})", CARGO_VERSION, PROTOCOL_VERSION)
}
