//! Device fingerprinting.
//!
//! The fingerprint is an opaque string that is stable for one host profile
//! across restarts. It travels with the session for audit purposes only; it
//! is never used as an authentication factor.

use sha2::{Digest, Sha256};

/// Supplies a stable opaque fingerprint for the current execution context.
pub trait FingerprintProvider: Send + Sync {
    fn fingerprint(&self) -> String;
}

/// Fingerprint derived from stable host attributes: OS, architecture,
/// hostname, locale, and local timezone offset.
pub struct HostFingerprint;

impl FingerprintProvider for HostFingerprint {
    fn fingerprint(&self) -> String {
        let hostname = std::env::var("HOSTNAME").unwrap_or_default();
        let locale = std::env::var("LANG").unwrap_or_default();
        let tz_offset = chrono::Local::now().offset().local_minus_utc();
        let base = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            std::env::consts::OS,
            std::env::consts::ARCH,
            std::env::consts::FAMILY,
            hostname,
            locale,
            tz_offset,
        );
        hex::encode(Sha256::digest(base.as_bytes()))
    }
}

/// Fixed fingerprint for tests and hosts with their own derivation scheme.
pub struct FixedFingerprint(pub String);

impl FingerprintProvider for FixedFingerprint {
    fn fingerprint(&self) -> String {
        self.0.clone()
    }
}
