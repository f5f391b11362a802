//! Runbook loading collaborator.
//!
//! The engine asks a `RunbookLoader` for compiled runbooks by path: at run
//! start, on every invoke, and when resuming a persisted session. Invoke
//! references resolve through the invoking runbook's `imports` aliases, then
//! relative to its directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::compiled::CompiledRunbook;
use super::definition::RunbookError;

/// Loads, validates, and compiles runbooks.
pub trait RunbookLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<CompiledRunbook>, RunbookError>;
}

/// Resolve an invoke reference (alias or relative path) against `base`.
pub fn resolve_reference(base: &CompiledRunbook, reference: &str) -> PathBuf {
    let target = base
        .definition()
        .imports
        .get(reference)
        .map(String::as_str)
        .unwrap_or(reference);

    let target = Path::new(target);
    if target.is_absolute() {
        return normalize(target);
    }
    let dir = base.path().parent().unwrap_or_else(|| Path::new(""));
    normalize(&dir.join(target))
}

/// Drop `.` components and fold `..` where possible.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runbook::definition::parse_runbook_yaml;

    fn base() -> CompiledRunbook {
        let yaml = r#"
name: parent
imports:
  cleanup: ../shared/cleanup.yaml
steps:
  - id: call
    type: invoke
    workflow: cleanup
"#;
        CompiledRunbook::compile(
            "/runbooks/disk/parent.yaml",
            parse_runbook_yaml(yaml).unwrap(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_alias() {
        assert_eq!(
            resolve_reference(&base(), "cleanup"),
            PathBuf::from("/runbooks/shared/cleanup.yaml")
        );
    }

    #[test]
    fn test_resolve_relative_path() {
        assert_eq!(
            resolve_reference(&base(), "./child.yaml"),
            PathBuf::from("/runbooks/disk/child.yaml")
        );
    }

    #[test]
    fn test_resolve_absolute_path() {
        assert_eq!(
            resolve_reference(&base(), "/other/x.yaml"),
            PathBuf::from("/other/x.yaml")
        );
    }

    #[test]
    fn test_normalize_relative_root() {
        assert_eq!(normalize(Path::new("./a/./b.yaml")), PathBuf::from("a/b.yaml"));
        assert_eq!(normalize(Path::new("../x.yaml")), PathBuf::from("../x.yaml"));
    }
}
