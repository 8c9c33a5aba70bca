//! Checkpoint storage: trait + file-system and in-memory implementations.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::Checkpoint;

/// Errors that can occur during checkpoint storage operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Integrity check failed for checkpoint of rule {rule}: stored hash does not match content")]
    IntegrityViolation { rule: String },

    #[error("Checkpoint for rule {rule} belongs to plan {found}, expected {expected}")]
    PlanMismatch {
        rule: String,
        expected: String,
        found: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Trait for checkpoint persistence backends.
pub trait CheckpointStore: Send + Sync {
    /// Store (replace) the checkpoint for its plan and rule.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Load the checkpoint for a rule under a plan, verifying integrity.
    fn load(&self, plan_fingerprint: &str, rule: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Every checkpoint recorded for a plan, ordered by rule.
    fn list(&self, plan_fingerprint: &str) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// Forget every checkpoint of a plan.
    fn clear(&self, plan_fingerprint: &str) -> Result<(), CheckpointError>;
}

/// File-system backed checkpoint store.
///
/// ```text
/// {root}/
///   {plan_fingerprint}/
///     {rule}.json
/// ```
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    /// Create a new store rooted at the given directory.
    /// Creates the directory if it doesn't exist.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn plan_dir(&self, plan_fingerprint: &str) -> PathBuf {
        self.root.join(file_stem(plan_fingerprint))
    }

    fn checkpoint_path(&self, plan_fingerprint: &str, rule: &str) -> PathBuf {
        self.plan_dir(plan_fingerprint)
            .join(format!("{}.json", file_stem(rule)))
    }

    fn read(&self, path: &std::path::Path) -> Result<Checkpoint, CheckpointError> {
        let json = fs::read_to_string(path)?;
        let cp: Checkpoint = serde_json::from_str(&json)?;
        if !cp.verify_integrity() {
            return Err(CheckpointError::IntegrityViolation { rule: cp.rule });
        }
        Ok(cp)
    }
}

/// Map an arbitrary id onto a safe file name.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let path = self.checkpoint_path(&checkpoint.plan_fingerprint, &checkpoint.rule);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename: readers never see a truncated checkpoint.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(checkpoint)?)?;
        fs::rename(&tmp, &path)?;

        tracing::debug!(
            rule = %checkpoint.rule,
            next_offset = checkpoint.next_offset,
            path = %path.display(),
            "Checkpoint saved"
        );
        Ok(())
    }

    fn load(&self, plan_fingerprint: &str, rule: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.checkpoint_path(plan_fingerprint, rule);
        if !path.exists() {
            return Ok(None);
        }
        let cp = self.read(&path)?;
        if cp.plan_fingerprint != plan_fingerprint {
            return Err(CheckpointError::PlanMismatch {
                rule: rule.to_string(),
                expected: plan_fingerprint.to_string(),
                found: cp.plan_fingerprint,
            });
        }
        Ok(Some(cp))
    }

    fn list(&self, plan_fingerprint: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        let dir = self.plan_dir(plan_fingerprint);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                out.push(self.read(&path)?);
            }
        }
        out.sort_by(|a, b| a.rule.cmp(&b.rule));
        Ok(out)
    }

    fn clear(&self, plan_fingerprint: &str) -> Result<(), CheckpointError> {
        let dir = self.plan_dir(plan_fingerprint);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            tracing::info!(plan = plan_fingerprint, "Checkpoints cleared");
        }
        Ok(())
    }
}

/// Process-local checkpoint store for dry runs and tests.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<BTreeMap<(String, String), Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Checkpoint>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.entries().insert(
            (checkpoint.plan_fingerprint.clone(), checkpoint.rule.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    fn load(&self, plan_fingerprint: &str, rule: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let found = self
            .entries()
            .get(&(plan_fingerprint.to_string(), rule.to_string()))
            .cloned();
        match found {
            Some(cp) if !cp.verify_integrity() => {
                Err(CheckpointError::IntegrityViolation { rule: cp.rule })
            }
            other => Ok(other),
        }
    }

    fn list(&self, plan_fingerprint: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        Ok(self
            .entries()
            .iter()
            .filter(|((plan, _), _)| plan == plan_fingerprint)
            .map(|(_, cp)| cp.clone())
            .collect())
    }

    fn clear(&self, plan_fingerprint: &str) -> Result<(), CheckpointError> {
        self.entries().retain(|(plan, _), _| plan != plan_fingerprint);
        Ok(())
    }
}
