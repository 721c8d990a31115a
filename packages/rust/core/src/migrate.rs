//! Bulk import of pre-existing content as already-finalized entities.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use walkdir::{DirEntry, WalkDir};

use pubflow_shared::{Document, EntityRecord, PipelineError, Result, WorkflowStep};

use crate::checkpoint::{CheckpointEmitter, ops};

/// A content item found on disk, ready to be tracked.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    /// Path relative to the scan root, without extension, `/`-separated.
    pub id: String,
    pub metadata: serde_json::Value,
}

/// Ids added and ids already tracked.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MigrationOutcome {
    pub added: Vec<String>,
    pub skipped: Vec<String>,
}

/// Walk `root` for files with one of `extensions`, sorted by id.
///
/// Hidden files and directories are ignored. Metadata carries the relative
/// path, a SHA-256 content hash and the size in bytes.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn discover_content(root: &Path, extensions: &[String]) -> Result<Vec<ContentItem>> {
    let files = collect_files(root, extensions)?;

    let mut items = Vec::with_capacity(files.len());
    for path in files {
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let bytes = std::fs::read(&path).map_err(|e| PipelineError::io(&path, e))?;
        let rel = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let id = relative
            .with_extension("")
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        items.push(ContentItem {
            id,
            metadata: serde_json::json!({
                "path": rel,
                "contentHash": compute_hash(&bytes),
                "sizeBytes": bytes.len(),
            }),
        });
    }

    items.sort_by(|a, b| a.id.cmp(&b.id));
    debug!(found = items.len(), "content discovered");
    Ok(items)
}

fn collect_files(root: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

    for entry in walker {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn walk_error(root: &Path, err: walkdir::Error) -> PipelineError {
    let path = err.path().unwrap_or(root).to_path_buf();
    PipelineError::io(path, err.into())
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|wanted| wanted.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        })
}

/// Compute SHA-256 hash of content.
fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Insert each item not yet tracked as a finalized entity.
pub fn insert_finalized(
    doc: &mut Document,
    emitter: &CheckpointEmitter,
    items: Vec<ContentItem>,
) -> MigrationOutcome {
    let mut outcome = MigrationOutcome::default();

    for item in items {
        if doc.entities.contains_key(&item.id) {
            outcome.skipped.push(item.id);
            continue;
        }
        let mut entity = EntityRecord::finalized(item.id.clone(), item.metadata);
        emitter.emit(
            &mut entity,
            WorkflowStep::Finalized,
            ops::MIGRATED,
            serde_json::Value::Null,
        );
        doc.entities.insert(item.id.clone(), entity);
        outcome.added.push(item.id);
    }

    info!(
        added = outcome.added.len(),
        skipped = outcome.skipped.len(),
        "migration applied"
    );
    outcome
}
