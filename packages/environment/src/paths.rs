// ABOUTME: Sandbox root confinement and working directory tracking
// ABOUTME: Lexically resolves caller paths and rejects anything that escapes base_path

use crate::error::{EnvironmentError, Result};
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

/// Lexically normalize `path`, resolving `.` and `..` without touching the filesystem.
///
/// Returns `None` when `..` would climb above the filesystem root.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    let mut depth = 0usize;

    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                normalized.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
        }
    }

    Some(normalized)
}

/// Root an environment is confined to plus its mutable working directory.
///
/// The working directory is stored relative to the root so it can never
/// point outside of it.
#[derive(Debug)]
pub struct Workspace {
    base: PathBuf,
    cwd: RwLock<PathBuf>,
}

impl Workspace {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let base = normalize(&base).unwrap_or(base);
        Self {
            base,
            cwd: RwLock::new(PathBuf::new()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Absolute current working directory
    pub async fn working_directory(&self) -> PathBuf {
        let cwd = self.cwd.read().await;
        if cwd.as_os_str().is_empty() {
            self.base.clone()
        } else {
            self.base.join(&*cwd)
        }
    }

    /// Resolve a caller-supplied path against the working directory
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let cwd = self.cwd.read().await.clone();
        self.resolve_from(&cwd, requested)
    }

    /// Resolve `requested` relative to `cwd` (itself relative to the root)
    pub fn resolve_from(&self, cwd: &Path, requested: &str) -> Result<PathBuf> {
        if requested.contains('\0') {
            return Err(EnvironmentError::InvalidInput(
                "path contains a NUL byte".to_string(),
            ));
        }

        let requested_path = Path::new(requested);
        let joined = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            self.base.join(cwd).join(requested_path)
        };

        match normalize(&joined) {
            Some(resolved) if resolved.starts_with(&self.base) => Ok(resolved),
            _ => {
                warn!(
                    "Rejected path outside sandbox root {}: {}",
                    self.base.display(),
                    requested
                );
                Err(EnvironmentError::PermissionDenied(format!(
                    "{} is outside the sandbox root {}",
                    requested,
                    self.base.display()
                )))
            }
        }
    }

    /// Change the working directory without touching the filesystem
    pub async fn change_directory(&self, requested: &str) -> Result<PathBuf> {
        let mut cwd = self.cwd.write().await;
        let resolved = self.resolve_from(&cwd, requested)?;
        *cwd = self.relative(&resolved);
        Ok(resolved)
    }

    /// Path relative to the root; empty for the root itself
    pub fn relative(&self, resolved: &Path) -> PathBuf {
        resolved
            .strip_prefix(&self.base)
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

/// Render a path for result payloads
pub(crate) fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
