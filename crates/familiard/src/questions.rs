//! Durable question store.
//!
//! Each question is one JSON file (`<id>.json`) written via temp file and rename. An
//! in-memory index (`id -> question`, `task -> [id]`) is rebuilt from disk on open. The
//! index mutex is never held across file I/O; writes are serialized by a separate
//! async lock and always persist the latest indexed copy of a record.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use familiar_core::{Detection, Id, Question};
use thiserror::Error;
use tracing::debug;

use crate::persist;

#[derive(Debug, Error)]
pub enum QuestionStoreError {
    #[error("question not found: {0}")]
    QuestionNotFound(String),
    #[error("question store io error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuestionStoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::QuestionNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, QuestionStoreError>;

#[derive(Debug, Default)]
struct Index {
    questions: HashMap<Id, Question>,
    by_task: HashMap<String, Vec<Id>>,
}

impl Index {
    fn insert(&mut self, question: Question) {
        let ids = self.by_task.entry(question.task_id.clone()).or_default();
        if !ids.contains(&question.id) {
            ids.push(question.id.clone());
        }
        self.questions.insert(question.id.clone(), question);
    }

    fn for_task(&self, task_id: &str) -> Vec<Question> {
        let mut out: Vec<Question> = self
            .by_task
            .get(task_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.questions.get(id).cloned())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }
}

#[derive(Debug)]
pub struct QuestionStore {
    dir: PathBuf,
    index: Mutex<Index>,
    write_lock: tokio::sync::Mutex<()>,
}

impl QuestionStore {
    /// Open the store at `dir`, rehydrating the index from disk.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut index = Index::default();
        for question in persist::load_dir::<Question>(&dir)? {
            index.insert(question);
        }
        debug!(
            path = %dir.display(),
            count = index.questions.len(),
            "question store loaded"
        );

        Ok(Self {
            dir,
            index: Mutex::new(index),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Index> {
        // A poisoned index is still structurally valid; keep serving it.
        self.index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn path_for(&self, id: &Id) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist the current indexed copy of `id`, if it still exists.
    async fn persist(&self, id: &Id) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.lock().questions.get(id).cloned();
        if let Some(question) = snapshot {
            persist::write_json(self.path_for(id), &question).await?;
        }
        Ok(())
    }

    /// Record a detected question unless the task already has a pending one.
    ///
    /// Returns `None` when the detection was suppressed.
    pub async fn create(
        &self,
        task_id: &str,
        step_task_id: &str,
        detection: Detection,
    ) -> Result<Option<Question>> {
        let question = {
            let mut index = self.lock();
            if index.for_task(task_id).iter().any(Question::is_pending) {
                return Ok(None);
            }
            let question = Question {
                id: Id::new(),
                task_id: task_id.to_string(),
                step_task_id: step_task_id.to_string(),
                question_type: detection.question_type,
                text: detection.text,
                options: detection.options,
                created_at: Utc::now(),
                answered_at: None,
                answer: None,
                delivered_at: None,
                error: None,
            };
            index.insert(question.clone());
            question
        };

        if let Err(e) = self.persist(&question.id).await {
            let mut index = self.lock();
            index.questions.remove(&question.id);
            if let Some(ids) = index.by_task.get_mut(task_id) {
                ids.retain(|id| id != &question.id);
            }
            return Err(e);
        }
        Ok(Some(question))
    }

    pub fn get(&self, id: &Id) -> Result<Question> {
        self.lock()
            .questions
            .get(id)
            .cloned()
            .ok_or_else(|| QuestionStoreError::QuestionNotFound(id.to_string()))
    }

    pub fn list_for_task(&self, task_id: &str) -> Vec<Question> {
        self.lock().for_task(task_id)
    }

    pub fn pending_for_task(&self, task_id: &str) -> Option<Question> {
        self.lock()
            .for_task(task_id)
            .into_iter()
            .find(Question::is_pending)
    }

    /// All unanswered questions, oldest first.
    pub fn list_pending(&self) -> Vec<Question> {
        let mut out: Vec<Question> = self
            .lock()
            .questions
            .values()
            .filter(|q| q.is_pending())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Apply `change` to a record and persist it. `change` returns false for a no-op.
    async fn update(&self, id: &Id, change: impl FnOnce(&mut Question) -> bool) -> Result<Question> {
        let (question, changed) = {
            let mut index = self.lock();
            let question = index
                .questions
                .get_mut(id)
                .ok_or_else(|| QuestionStoreError::QuestionNotFound(id.to_string()))?;
            let changed = change(question);
            (question.clone(), changed)
        };
        if changed {
            self.persist(id).await?;
        }
        Ok(question)
    }

    /// Record the answer. A second call on an answered question changes nothing.
    pub async fn mark_answered(&self, id: &Id, answer: &str) -> Result<Question> {
        self.update(id, |q| {
            if q.answered_at.is_some() {
                return false;
            }
            q.answered_at = Some(Utc::now());
            q.answer = Some(answer.to_string());
            true
        })
        .await
    }

    /// Record that the answer reached the agent.
    pub async fn mark_delivered(&self, id: &Id) -> Result<Question> {
        self.update(id, |q| {
            if q.delivered_at.is_some() {
                return false;
            }
            q.delivered_at = Some(Utc::now());
            q.error = None;
            true
        })
        .await
    }

    /// Record a delivery failure. Ignored once the answer has been delivered.
    pub async fn mark_delivery_failed(&self, id: &Id, error: &str) -> Result<Question> {
        self.update(id, |q| {
            if q.delivered_at.is_some() || q.error.as_deref() == Some(error) {
                return false;
            }
            q.error = Some(error.to_string());
            true
        })
        .await
    }

    /// Drop every question for a task, from memory and disk.
    pub async fn clear_task(&self, task_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let ids = {
            let mut index = self.lock();
            let ids = index.by_task.remove(task_id).unwrap_or_default();
            for id in &ids {
                index.questions.remove(id);
            }
            ids
        };
        for id in &ids {
            persist::remove(self.path_for(id)).await?;
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use familiar_core::QuestionType;
    use tempfile::TempDir;

    fn confirmation() -> Detection {
        Detection {
            question_type: QuestionType::Confirmation,
            text: "Continue with changes? (y/n)".to_string(),
            options: Some(vec!["y".to_string(), "n".to_string()]),
        }
    }

    #[tokio::test]
    async fn only_one_pending_question_per_task() {
        let dir = TempDir::new().unwrap();
        let store = QuestionStore::open(dir.path()).unwrap();

        let first = store.create("T1", "T1/implement", confirmation()).await.unwrap();
        assert!(first.is_some());
        let second = store.create("T1", "T1/implement", confirmation()).await.unwrap();
        assert!(second.is_none());
        // Other tasks are unaffected.
        assert!(store.create("T2", "T2/implement", confirmation()).await.unwrap().is_some());

        let first = first.unwrap();
        store.mark_answered(&first.id, "y").await.unwrap();
        assert!(store.create("T1", "T1/implement", confirmation()).await.unwrap().is_some());
        assert_eq!(store.list_for_task("T1").len(), 2);
    }

    #[tokio::test]
    async fn mark_answered_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = QuestionStore::open(dir.path()).unwrap();
        let q = store.create("T1", "T1/s", confirmation()).await.unwrap().unwrap();

        let answered = store.mark_answered(&q.id, "y").await.unwrap();
        let again = store.mark_answered(&q.id, "n").await.unwrap();
        assert_eq!(again.answer.as_deref(), Some("y"));
        assert_eq!(again.answered_at, answered.answered_at);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let q = {
            let store = QuestionStore::open(dir.path()).unwrap();
            let q = store.create("T1", "T1/s", confirmation()).await.unwrap().unwrap();
            store.mark_answered(&q.id, "y").await.unwrap();
            store.mark_delivery_failed(&q.id, "stdin closed").await.unwrap();
            store.get(&q.id).unwrap()
        };

        let reopened = QuestionStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(&q.id).unwrap(), q);
        assert_eq!(reopened.list_for_task("T1"), vec![q]);
    }

    #[tokio::test]
    async fn delivery_transitions_are_independent() {
        let dir = TempDir::new().unwrap();
        let store = QuestionStore::open(dir.path()).unwrap();
        let q = store.create("T1", "T1/s", confirmation()).await.unwrap().unwrap();

        let failed = store.mark_delivery_failed(&q.id, "agent exited").await.unwrap();
        assert_eq!(failed.error.as_deref(), Some("agent exited"));
        assert!(failed.answered_at.is_none());

        let delivered = store.mark_delivered(&q.id).await.unwrap();
        assert!(delivered.delivered_at.is_some());
        assert!(delivered.error.is_none());

        let after = store.mark_delivery_failed(&q.id, "late").await.unwrap();
        assert_eq!(after.delivered_at, delivered.delivered_at);
        assert!(after.error.is_none());
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let dir = TempDir::new().unwrap();
        let store = QuestionStore::open(dir.path()).unwrap();
        let missing = Id::new();
        assert!(store.get(&missing).unwrap_err().is_not_found());
        assert!(store.mark_answered(&missing, "y").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn clear_task_removes_records() {
        let dir = TempDir::new().unwrap();
        let store = QuestionStore::open(dir.path()).unwrap();
        store.create("T1", "T1/s", confirmation()).await.unwrap();
        store.create("T2", "T2/s", confirmation()).await.unwrap();

        assert_eq!(store.clear_task("T1").await.unwrap(), 1);
        assert!(store.list_for_task("T1").is_empty());
        assert_eq!(store.list_pending().len(), 1);

        let reopened = QuestionStore::open(dir.path()).unwrap();
        assert!(reopened.list_for_task("T1").is_empty());
        assert_eq!(reopened.list_for_task("T2").len(), 1);
    }
}
