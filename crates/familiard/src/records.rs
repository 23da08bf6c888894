//! Durable agent process records, one JSON file per task.

use std::path::{Path, PathBuf};

use familiar_core::prompt::task_slug;
use familiar_core::AgentProcessRecord;
use thiserror::Error;

use crate::persist;

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record store io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RecordStoreError>;

#[derive(Debug, Clone)]
pub struct ProcessRecordStore {
    dir: PathBuf,
}

impl ProcessRecordStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_slug(task_id)))
    }

    pub async fn save(&self, record: &AgentProcessRecord) -> Result<()> {
        persist::write_json(self.path_for(&record.task_id), record).await?;
        Ok(())
    }

    pub async fn remove(&self, task_id: &str) -> Result<()> {
        persist::remove(self.path_for(task_id)).await?;
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<AgentProcessRecord>> {
        Ok(persist::load_dir(&self.dir)?)
    }
}
