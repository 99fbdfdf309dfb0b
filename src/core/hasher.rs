//! WR-007: BLAKE3 fingerprints for environments.

use super::error::{InfraError, Result};
use super::types::Environment;

/// Runtime property holding the environment fingerprint.
pub const ENVIRONMENT_HASH_PROPERTY: &str = "environment.hash";

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Fingerprint of an environment's canonical JSON form.
///
/// Map order is preserved by `IndexMap`, so reordering machines or servers
/// yields a different fingerprint.
pub fn fingerprint(env: &Environment) -> Result<String> {
    let json = serde_json::to_string(env)
        .map_err(|e| InfraError::internal(format!("cannot serialize environment: {}", e)))?;
    Ok(hash_string(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{MachineConfig, Recipe};

    fn env(content: &str) -> Environment {
        let mut e = Environment {
            recipe: Recipe::inline("script", content),
            ..Environment::default()
        };
        e.machines.insert("dev".into(), MachineConfig::default());
        e
    }

    #[test]
    fn test_wr007_hash_string_format() {
        let h = hash_string("hello");
        assert!(h.starts_with("blake3:"));
        assert_eq!(h.len(), "blake3:".len() + 64);
    }

    #[test]
    fn test_wr007_fingerprint_stable() {
        assert_eq!(fingerprint(&env("a")).unwrap(), fingerprint(&env("a")).unwrap());
    }

    #[test]
    fn test_wr007_fingerprint_changes_with_content() {
        assert_ne!(fingerprint(&env("a")).unwrap(), fingerprint(&env("b")).unwrap());
    }
}
