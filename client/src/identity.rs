//! Persistent identity of this peer across runs and reconnects

use log::info;
use rand::Rng;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Builder;

/// Reads, creates and forgets the id stored in a single file.
#[derive(Debug, Clone)]
pub struct IdentityProvider {
    path: PathBuf,
}

impl IdentityProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored id, generating and storing a fresh one when the
    /// file is missing or blank.
    pub fn get_or_create_persistent_id(&self) -> io::Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let id = generate_persistent_id(&mut rand::thread_rng());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, &id)?;
        info!("Created persistent id {} at {}", id, self.path.display());
        Ok(id)
    }

    /// Deletes the stored id; the next call to
    /// [`get_or_create_persistent_id`](Self::get_or_create_persistent_id)
    /// makes a new one. Returns false if there was nothing to delete.
    pub fn reset_persistent_id(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Persistent id at {} reset", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Random version 4 UUID in its hyphenated form.
pub fn generate_persistent_id<R: Rng>(rng: &mut R) -> String {
    Builder::from_random_bytes(rng.gen()).into_uuid().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn scratch_provider() -> IdentityProvider {
        let name = format!("peer-id-test-{}", generate_persistent_id(&mut rand::thread_rng()));
        IdentityProvider::new(std::env::temp_dir().join(name))
    }

    #[test]
    fn test_generated_id_is_uuid_v4() {
        let id = generate_persistent_id(&mut StdRng::seed_from_u64(7));

        let parsed = uuid::Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(parsed.get_variant(), uuid::Variant::RFC4122);
        assert_eq!(parsed.hyphenated().to_string(), id);
    }

    #[test]
    fn test_ids_differ() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = generate_persistent_id(&mut rng);
        let b = generate_persistent_id(&mut rng);
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_is_stable_until_reset() {
        let provider = scratch_provider();

        let first = provider.get_or_create_persistent_id().unwrap();
        let again = provider.get_or_create_persistent_id().unwrap();
        assert_eq!(first, again);

        assert!(provider.reset_persistent_id().unwrap());
        assert!(!provider.reset_persistent_id().unwrap());

        let fresh = provider.get_or_create_persistent_id().unwrap();
        assert_ne!(first, fresh);
        provider.reset_persistent_id().unwrap();
    }

    #[test]
    fn test_existing_id_is_trimmed() {
        let provider = scratch_provider();
        fs::write(provider.path(), "  alice\n").unwrap();

        assert_eq!(provider.get_or_create_persistent_id().unwrap(), "alice");
        provider.reset_persistent_id().unwrap();
    }

    #[test]
    fn test_blank_file_is_replaced() {
        let provider = scratch_provider();
        fs::write(provider.path(), "\n").unwrap();

        let id = provider.get_or_create_persistent_id().unwrap();
        assert_eq!(id.len(), 36);
        assert_eq!(fs::read_to_string(provider.path()).unwrap(), id);
        provider.reset_persistent_id().unwrap();
    }
}
