//! Key name construction.
//!
//! Every durable key is namespaced under a process-wide prefix so multiple
//! deployments can share one store. The separator is `:`.

const SEPARATOR: &str = ":";

/// Builds namespaced key names under a fixed prefix.
#[derive(Debug, Clone)]
pub struct KeyNamespace {
    prefix: String,
}

impl KeyNamespace {
    /// Create a namespace with the given prefix. An empty prefix yields
    /// un-prefixed keys.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Join the given parts into a key name under the prefix.
    pub fn key(&self, parts: &[&str]) -> String {
        let mut pieces: Vec<&str> = Vec::with_capacity(parts.len() + 1);
        if !self.prefix.is_empty() {
            pieces.push(&self.prefix);
        }
        pieces.extend_from_slice(parts);
        pieces.join(SEPARATOR)
    }
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new(crate::env::DEFAULT_KEY_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_key() {
        let ns = KeyNamespace::new("maas");
        assert_eq!(ns.key(&["session", "42"]), "maas:session:42");
    }

    #[test]
    fn test_empty_prefix() {
        let ns = KeyNamespace::new("");
        assert_eq!(ns.key(&["resources"]), "resources");
    }

    #[test]
    fn test_single_part() {
        let ns = KeyNamespace::new("maas");
        assert_eq!(ns.key(&["next_session_id"]), "maas:next_session_id");
    }
}
