//! Directory browsing endpoints used by the setup UI.
//!
//! Both endpoints are confined to the configured files root: relative
//! paths resolve against it, and anything that resolves outside of it
//! (including through symlinks or `..`) is rejected with `403`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use demps_types::{Deleted, DirectoryContents, DirectoryListing};
use serde::Deserialize;
use tracing::info;

use crate::error::ObserverError;
use crate::state::AppState;

/// Request body for `POST /api/directory/get`.
#[derive(Debug, Default, Deserialize)]
pub struct ListRequest {
    /// Directory to list.
    pub path: Option<String>,
    /// Listing filters.
    #[serde(default)]
    pub options: ListOptions,
}

/// Filters for a directory listing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOptions {
    /// Only list files with one of these extensions (e.g. `.txt`).
    /// Empty or absent lists every file.
    pub extensions: Option<Vec<String>>,
    /// List files at all (default true).
    pub include_files: Option<bool>,
}

/// Request body for `DELETE /api/directory/delete`.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteRequest {
    /// File or directory to delete.
    pub path: Option<String>,
}

/// List a directory's files and folders.
///
/// # Route
///
/// `POST /api/directory/get`
pub async fn list(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ListRequest>,
) -> Result<Json<DirectoryListing>, ObserverError> {
    let raw = non_empty(request.path)?;
    let path = resolve(state.files_root(), &raw).await?;

    let is_dir = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta.is_dir(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(ObserverError::Internal(format!("failed to stat {raw}: {e}"))),
    };
    if !is_dir {
        return Err(ObserverError::NotFound(format!("directory {raw} does not exist")));
    }

    let contents = read_contents(&path, &request.options)
        .await
        .map_err(|e| ObserverError::Internal(format!("failed to list {raw}: {e}")))?;
    Ok(Json(DirectoryListing { contents }))
}

/// Delete a file, or a directory and everything in it.
///
/// # Route
///
/// `DELETE /api/directory/delete`
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<Deleted>, ObserverError> {
    let raw = non_empty(request.path)?;
    let root = canonical_root(state.files_root()).await?;
    let path = resolve(&root, &raw).await?;
    if path == root {
        return Err(ObserverError::Forbidden(String::from("refusing to delete the files root")));
    }

    let meta = match tokio::fs::symlink_metadata(&path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ObserverError::NotFound(format!("{raw} does not exist")));
        }
        Err(e) => return Err(ObserverError::Internal(format!("failed to stat {raw}: {e}"))),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(&path).await
    } else {
        tokio::fs::remove_file(&path).await
    };
    result.map_err(|e| ObserverError::Internal(format!("failed to delete {raw}: {e}")))?;

    info!(path = %path.display(), "Deleted");
    Ok(Json(Deleted { deleted: raw }))
}

fn non_empty(path: Option<String>) -> Result<String, ObserverError> {
    path.filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ObserverError::BadRequest(String::from("no directory provided")))
}

async fn canonical_root(root: &Path) -> Result<PathBuf, ObserverError> {
    tokio::fs::canonicalize(root)
        .await
        .map_err(|e| ObserverError::Internal(format!("files root {} unavailable: {e}", root.display())))
}

/// Resolve `raw` against `root`, rejecting anything outside it.
async fn resolve(root: &Path, raw: &str) -> Result<PathBuf, ObserverError> {
    let root = canonical_root(root).await?;
    let requested = Path::new(raw);
    let candidate = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };

    match tokio::fs::canonicalize(&candidate).await {
        Ok(resolved) if resolved.starts_with(&root) => Ok(resolved),
        Ok(_) => Err(ObserverError::Forbidden(format!("{raw} is outside the files root"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let escapes = candidate
                .components()
                .any(|c| matches!(c, Component::ParentDir))
                || !candidate.starts_with(&root);
            if escapes {
                Err(ObserverError::Forbidden(format!("{raw} is outside the files root")))
            } else {
                Err(ObserverError::NotFound(format!("{raw} does not exist")))
            }
        }
        Err(e) => Err(ObserverError::Internal(format!("failed to resolve {raw}: {e}"))),
    }
}

async fn read_contents(dir: &Path, options: &ListOptions) -> std::io::Result<DirectoryContents> {
    let include_files = options.include_files.unwrap_or(true);
    let extensions: Vec<String> = options
        .extensions
        .iter()
        .flatten()
        .map(|ext| ext.to_ascii_lowercase())
        .collect();

    let mut contents = DirectoryContents::default();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(meta) = tokio::fs::metadata(entry.path()).await else {
            continue;
        };
        if meta.is_dir() {
            contents.folders.push(name);
        } else if meta.is_file() && include_files && extension_matches(&name, &extensions) {
            contents.files.push(name);
        }
    }
    contents.files.sort();
    contents.folders.sort();
    Ok(contents)
}

/// Whether `name` carries one of `extensions` (dot included, lowercase).
fn extension_matches(name: &str, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    let ext = Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default();
    extensions.iter().any(|wanted| *wanted == ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter() {
        let wanted = vec![String::from(".ini"), String::from(".config")];
        assert!(extension_matches("sim.INI", &wanted));
        assert!(extension_matches("a.config", &wanted));
        assert!(!extension_matches("a.txt", &wanted));
        assert!(!extension_matches("Makefile", &wanted));
        assert!(extension_matches("Makefile", &[]));
    }

    #[tokio::test]
    async fn resolve_confines_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("runs")).unwrap();

        assert_eq!(resolve(&root, "runs").await.unwrap(), root.join("runs"));
        assert!(matches!(
            resolve(&root, "missing").await,
            Err(ObserverError::NotFound(_))
        ));
        assert!(matches!(
            resolve(&root, "../outside").await,
            Err(ObserverError::Forbidden(_))
        ));
        assert!(matches!(
            resolve(&root, "/").await,
            Err(ObserverError::Forbidden(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_forbidden() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        assert!(matches!(
            resolve(&root, "link").await,
            Err(ObserverError::Forbidden(_))
        ));
    }
}
