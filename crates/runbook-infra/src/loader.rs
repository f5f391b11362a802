//! Filesystem runbook loader.
//!
//! Implements `RunbookLoader` from `runbook-core` over YAML files. Paths are
//! made absolute and normalized so the same runbook always has one identity
//! in sessions. Compiled runbooks are cached by path and reused while the
//! file's digest is unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use runbook_core::runbook::compiled::CompiledRunbook;
use runbook_core::runbook::definition::{
    RunbookError, deserialize_runbook_yaml, read_runbook_source,
};
use runbook_core::runbook::loader::{RunbookLoader, normalize};
use runbook_core::service::hash::ContentHasher;

use crate::hash::Sha256ContentHasher;

/// Loads runbooks from disk, caching compiled trees by digest.
pub struct FsRunbookLoader<H: ContentHasher = Sha256ContentHasher> {
    hasher: H,
    cache: DashMap<PathBuf, Arc<CompiledRunbook>>,
}

impl FsRunbookLoader<Sha256ContentHasher> {
    pub fn new() -> Self {
        Self::with_hasher(Sha256ContentHasher::new())
    }
}

impl Default for FsRunbookLoader<Sha256ContentHasher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ContentHasher> FsRunbookLoader<H> {
    pub fn with_hasher(hasher: H) -> Self {
        Self {
            hasher,
            cache: DashMap::new(),
        }
    }

    /// Number of compiled runbooks held.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

impl<H: ContentHasher> RunbookLoader for FsRunbookLoader<H> {
    fn load(&self, path: &Path) -> Result<Arc<CompiledRunbook>, RunbookError> {
        let path = normalize(&std::path::absolute(path)?);
        let source = read_runbook_source(&path)?;
        let digest = self.hasher.compute_hash(&source);

        if let Some(cached) = self.cache.get(&path) {
            if cached.digest() == Some(digest.as_str()) {
                return Ok(Arc::clone(cached.value()));
            }
            tracing::debug!(path = %path.display(), "runbook changed on disk, recompiling");
        }

        let definition = deserialize_runbook_yaml(&source)?;
        let compiled = Arc::new(CompiledRunbook::compile(
            path.clone(),
            definition,
            Some(digest),
        )?);
        tracing::debug!(
            path = %path.display(),
            name = %compiled.name(),
            steps = compiled.step_count(),
            "compiled runbook"
        );
        self.cache.insert(path, Arc::clone(&compiled));
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RB: &str = "name: disk\nsteps:\n  - id: check\n    type: command\n    command: df -h\n";

    #[test]
    fn test_load_caches_until_file_changes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.yaml");
        std::fs::write(&path, RB).unwrap();
        let loader = FsRunbookLoader::new();

        let first = loader.load(&path).unwrap();
        let again = loader.load(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.digest().map(str::len), Some(64));
        assert_eq!(loader.cached(), 1);

        std::fs::write(&path, RB.replace("df -h", "df -i")).unwrap();
        let changed = loader.load(&path).unwrap();
        assert!(!Arc::ptr_eq(&first, &changed));
        assert_ne!(first.digest(), changed.digest());
    }

    struct FixedHasher;

    impl ContentHasher for FixedHasher {
        fn compute_hash(&self, _content: &str) -> String {
            "fixed".to_string()
        }
    }

    #[test]
    fn test_digest_hit_skips_parse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.yaml");
        std::fs::write(&path, RB).unwrap();
        let loader = FsRunbookLoader::with_hasher(FixedHasher);

        let first = loader.load(&path).unwrap();
        // Unparseable now, but the digest still matches the cached entry.
        std::fs::write(&path, "name: [unclosed").unwrap();
        let again = loader.load(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.digest(), Some("fixed"));
    }

    #[test]
    fn test_load_normalizes_path() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("disk.yaml"), RB).unwrap();
        let loader = FsRunbookLoader::new();

        let rb = loader
            .load(&dir.path().join("sub").join("..").join("./disk.yaml"))
            .unwrap();
        assert_eq!(rb.path(), normalize(&dir.path().join("disk.yaml")));
    }

    #[test]
    fn test_missing_and_invalid() {
        let dir = tempdir().unwrap();
        let loader = FsRunbookLoader::new();
        assert!(matches!(
            loader.load(&dir.path().join("absent.yaml")),
            Err(RunbookError::NotFound(_))
        ));

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "name: bad\nsteps: []\n").unwrap();
        assert!(matches!(
            loader.load(&bad),
            Err(RunbookError::ValidationError(_))
        ));
    }
}
