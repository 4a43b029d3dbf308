//! Private swarm keys.
//!
//! Every node on the same chain derives the same pre-shared key, partitioning
//! the replication network per chain. An operator may override the seed to
//! run a deliberately separate swarm.

use sha2::{Digest, Sha256};
use std::{fs, io, path::Path};

/// File the swarm key is materialized into, inside the store directory.
pub const SWARM_KEY_FILE: &str = "swarm.key";

/// Returns the seed the swarm key is derived from: the operator override if
/// one is configured, the chain id otherwise.
pub fn swarm_key_seed(chain_id: &str, override_seed: Option<&str>) -> String {
    match override_seed {
        Some(seed) if !seed.is_empty() => seed.to_owned(),
        _ => chain_id.to_owned(),
    }
}

/// Derives the 32-byte pre-shared key from `seed`, hex encoded.
pub fn swarm_key(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Writes the key file for `seed` into `dir` in the standard pre-shared key
/// format:
///
/// ```text
/// /key/swarm/psk/1.0.0/
/// /base16/
/// <64 hex chars>
/// ```
pub fn write_swarm_key_file(dir: &Path, seed: &str) -> io::Result<()> {
    let contents = format!("/key/swarm/psk/1.0.0/\n/base16/\n{}\n", swarm_key(seed));
    fs::write(dir.join(SWARM_KEY_FILE), contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_prefers_non_empty_override() {
        assert_eq!(swarm_key_seed("chain-1", None), "chain-1");
        assert_eq!(swarm_key_seed("chain-1", Some("")), "chain-1");
        assert_eq!(swarm_key_seed("chain-1", Some("private")), "private");
    }

    #[test]
    fn key_is_deterministic_per_seed() {
        let key = swarm_key("chain-1");
        assert_eq!(key.len(), 64);
        assert_eq!(key, swarm_key("chain-1"));
        assert_ne!(key, swarm_key("chain-2"));
    }

    #[test]
    fn key_file_uses_psk_format() {
        let dir = tempfile::tempdir().unwrap();
        write_swarm_key_file(dir.path(), "chain-1").unwrap();

        let contents = fs::read_to_string(dir.path().join(SWARM_KEY_FILE)).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines[0], "/key/swarm/psk/1.0.0/");
        assert_eq!(lines[1], "/base16/");
        assert_eq!(lines[2], swarm_key("chain-1"));
    }
}
