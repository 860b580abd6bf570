//! Issuing seed persisted next to the runtime configuration.

use anyhow::{anyhow, Result};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use zeroize::Zeroize;

pub const SEED_FILE: &str = "keybox.seed";
const SEED_PREFIX: &str = "keybox:";

/// Reads the issuing seed at `path`, creating a random one if absent.
///
/// Concurrent creators race on `create_new`; the loser reads the winner's seed.
pub fn load_or_create_seed(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(raw) => return stored_seed(path, &raw),
        Err(err) if err.kind() != ErrorKind::NotFound => {
            return Err(anyhow!("failed to read issuing seed {}: {}", path.display(), err))
        }
        Err(_) => {}
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| anyhow!("failed to create {}: {}", parent.display(), e))?;
    }

    let mut seed_bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed_bytes);
    let seed = format!("{}{}", SEED_PREFIX, hex::encode(seed_bytes));
    seed_bytes.zeroize();

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    match options.open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", seed)
                .and_then(|_| file.sync_all())
                .map_err(|e| anyhow!("failed to write issuing seed {}: {}", path.display(), e))?;
            log::info!("created issuing seed {}", path.display());
            Ok(seed)
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let raw = fs::read_to_string(path)
                .map_err(|e| anyhow!("failed to read issuing seed {}: {}", path.display(), e))?;
            stored_seed(path, &raw)
        }
        Err(err) => Err(anyhow!("failed to create issuing seed {}: {}", path.display(), err)),
    }
}

fn stored_seed(path: &Path, raw: &str) -> Result<String> {
    match raw.trim() {
        "" => Err(anyhow!("issuing seed file {} is empty", path.display())),
        seed => Ok(seed.to_string()),
    }
}

/// Derives the ed25519 issuing key as `SHA-256(seed)`.
pub fn signing_key_from_seed(seed: &str) -> Result<SigningKey> {
    let trimmed = seed.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("issuing seed is required"));
    }
    let mut digest: [u8; 32] = Sha256::digest(trimmed.as_bytes()).into();
    let key = SigningKey::from_bytes(&digest);
    digest.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_seed_is_reused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join(SEED_FILE);
        let first = load_or_create_seed(&path)?;
        assert!(first.starts_with(SEED_PREFIX));
        let second = load_or_create_seed(&path)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn existing_seed_is_read_as_is() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(SEED_FILE);
        fs::write(&path, "  keybox:provisioned\n")?;
        assert_eq!(load_or_create_seed(&path)?, "keybox:provisioned");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn created_seed_is_private() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(SEED_FILE);
        load_or_create_seed(&path)?;
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o600);
        Ok(())
    }

    #[test]
    fn empty_seed_file_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(SEED_FILE);
        fs::write(&path, "  \n")?;
        assert!(load_or_create_seed(&path).is_err());
        Ok(())
    }

    #[test]
    fn same_seed_same_key() -> Result<()> {
        let a = signing_key_from_seed("keybox:abc")?;
        let b = signing_key_from_seed(" keybox:abc\n")?;
        assert_eq!(a.verifying_key(), b.verifying_key());
        assert!(signing_key_from_seed("").is_err());
        Ok(())
    }
}
