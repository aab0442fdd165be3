//! Environment constants and lookup helpers.
//!
//! Centralizes the environment variable names, Docker secret locations, and
//! default connection parameters used across the services, so deployment
//! wiring lives in one place.

use std::path::Path;

/// Environment variable naming the KV store host.
pub const ENV_REDIS_HOST: &str = "REDIS_HOST";

/// Environment variable naming the KV store port.
pub const ENV_REDIS_PORT: &str = "REDIS_PORT";

/// Environment variable holding the KV store password.
pub const ENV_REDIS_PASS: &str = "REDIS_PASS";

/// Docker secret file consulted for the KV store password when the
/// environment variable is unset.
pub const REDIS_PASS_SECRET_FILE: &str = "/run/secrets/redis_pass";

/// Default KV store host.
pub const DEFAULT_REDIS_HOST: &str = "redis";

/// Default KV store port.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Process-wide key namespace prefix.
pub const DEFAULT_KEY_PREFIX: &str = "maas";

/// Default resource pool name.
pub const DEFAULT_RESOURCE_POOL: &str = "maas";

/// Resolve the KV store host from the environment, falling back to the default.
pub fn redis_host() -> String {
    std::env::var(ENV_REDIS_HOST).unwrap_or_else(|_| DEFAULT_REDIS_HOST.to_string())
}

/// Resolve the KV store port from the environment, falling back to the default.
pub fn redis_port() -> u16 {
    std::env::var(ENV_REDIS_PORT)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_REDIS_PORT)
}

/// Resolve the KV store password.
///
/// Checks the environment first, then the Docker secret file. Returns `None`
/// when neither is present (unauthenticated store).
pub fn redis_password() -> Option<String> {
    if let Ok(password) = std::env::var(ENV_REDIS_PASS) {
        return Some(password);
    }
    read_secret_file(Path::new(REDIS_PASS_SECRET_FILE))
}

/// Read a Docker secret file, trimming the trailing newline Docker appends.
pub fn read_secret_file(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|contents| contents.trim_end().to_string())
        .filter(|secret| !secret.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_secret_file_trims_newline() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "s3cret").unwrap();
        assert_eq!(
            read_secret_file(file.path()),
            Some("s3cret".to_string())
        );
    }

    #[test]
    fn test_read_secret_file_missing() {
        assert_eq!(read_secret_file(Path::new("/nonexistent/secret")), None);
    }
}
