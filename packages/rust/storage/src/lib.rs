//! JSON document store for pipeline state.
//!
//! The [`StateStore`] owns a single JSON file holding the whole [`Document`].
//! Every save replaces the file atomically, so a reader sees either the previous
//! snapshot or the new one, never a partial write.
//!
//! **Access rules:**
//! - The orchestrator and admin operations: read-write (sole writer) via [`StateStore::open`]
//! - Status queries: read-only via [`StateStore::open_readonly`]
//!
//! Concurrent writer processes against the same file are not supported.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use pubflow_shared::{Document, PipelineError, Result};
use tracing::{debug, info, instrument};

/// Handle to the persisted state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    readonly: bool,
}

impl StateStore {
    /// Open the store at `path` in read-write mode. The file need not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            readonly: false,
        }
    }

    /// Open the store at `path` in read-only mode.
    pub fn open_readonly(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            readonly: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a document has been saved at this path.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the document, or a fresh empty one if nothing has been saved yet.
    ///
    /// Unparseable bytes or a document that violates the state invariants yield
    /// [`PipelineError::CorruptState`]; the file is never rewritten in that case.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<Document> {
        if !self.path.exists() {
            debug!("state file not found, starting from an empty document");
            return Ok(Document::new());
        }

        let content =
            std::fs::read_to_string(&self.path).map_err(|e| PipelineError::io(&self.path, e))?;

        let doc: Document = serde_json::from_str(&content)
            .map_err(|e| PipelineError::corrupt(&self.path, format!("unparseable document: {e}")))?;

        doc.validate()
            .map_err(|msg| PipelineError::corrupt(&self.path, msg))?;

        debug!(entities = doc.entities.len(), version = %doc.version, "state loaded");
        Ok(doc)
    }

    /// Persist `doc`, stamping `last_updated`.
    ///
    /// Writes to a sibling temp file, syncs it, then renames it over the target.
    #[instrument(skip_all, fields(path = %self.path.display(), entities = doc.entities.len()))]
    pub fn save(&self, doc: &mut Document) -> Result<()> {
        self.check_writable()?;

        doc.validate().map_err(|msg| {
            PipelineError::corrupt(&self.path, format!("refusing to save invalid document: {msg}"))
        })?;

        doc.last_updated = Utc::now();
        let mut json = serde_json::to_string_pretty(doc)?;
        json.push('\n');

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| PipelineError::io(&parent, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "state.json".to_string());
        let temp = parent.join(format!(".{file_name}.tmp"));

        // Write to temp file first
        {
            let mut file = File::create(&temp).map_err(|e| PipelineError::io(&temp, e))?;
            file.write_all(json.as_bytes())
                .map_err(|e| PipelineError::io(&temp, e))?;
            file.sync_all().map_err(|e| PipelineError::io(&temp, e))?;
        }

        // Atomic rename
        std::fs::rename(&temp, &self.path).map_err(|e| PipelineError::io(&self.path, e))?;

        info!(bytes = json.len(), "state saved");
        Ok(())
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PipelineError::io(
                &self.path,
                std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "state store is opened in read-only mode",
                ),
            ));
        }
        Ok(())
    }
}
