//! Logging setup for simplebank binaries.

pub mod tracing;

pub use self::tracing::{init_with, LogFormat};

/// Installs the global subscriber, format from `LOG_FORMAT`.
///
/// Later calls leave the first subscriber in place.
pub fn init() {
    self::tracing::init();
}
