use crate::id::is_valid_id;
use crate::lifecycle::ContainerState;
use crate::CoreError;
use corral_runtime::{ExitOutcome, ResourceGroup, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

const RECORD_FILE: &str = "config.json";
const ROOTFS_DIR: &str = "rootfs";

/// Persisted view of one container, rewritten on every state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
    #[serde(default)]
    pub pid: Option<u32>,
    pub state: ContainerState,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<ResourceGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitOutcome>,
    pub created_at: String,
    pub updated_at: String,
}

/// `<state_dir>/containers/<id>/{config.json,rootfs/}`
#[derive(Debug, Clone)]
pub struct ContainerStore {
    root: PathBuf,
}

impl ContainerStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            root: state_dir.as_ref().join("containers"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn rootfs_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(ROOTFS_DIR)
    }

    pub fn put(&self, record: &ContainerRecord) -> Result<(), CoreError> {
        let dir = self.container_dir(&record.id);
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(record)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(RECORD_FILE))
            .map_err(|e| CoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<ContainerRecord, CoreError> {
        let path = self.container_dir(id).join(RECORD_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(id.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Delete the record together with the container's rootfs.
    pub fn remove(&self, id: &str) -> Result<(), CoreError> {
        match fs::remove_dir_all(self.container_dir(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable record, sorted by id. Corrupt entries are skipped.
    pub fn list(&self) -> Result<Vec<ContainerRecord>, CoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().filter(|n| is_valid_id(n)) else {
                continue;
            };
            match self.get(id) {
                Ok(record) => results.push(record),
                Err(e) => warn!("skipping unreadable container record '{id}': {e}"),
            }
        }
        results.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(results)
    }
}

fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
