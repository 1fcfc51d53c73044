// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Dead-letter stores.
//!
//! [`InMemoryDeadLetterStore`] for tests and ephemeral nodes;
//! [`FileDeadLetterStore`] keeps an append-only JSON-lines journal of
//! `insert`/`remove` records and rebuilds its index from it on open, so
//! entries survive restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::delivery::DeadLetterStore;
use crate::domain::envelope::EnvelopeId;
use crate::domain::errors::DeadLetterError;
use crate::domain::reply::DeadLetter;

fn sorted(mut letters: Vec<DeadLetter>) -> Vec<DeadLetter> {
    letters.sort_by(|a, b| a.dead_lettered_at.cmp(&b.dead_lettered_at));
    letters
}

#[derive(Default, Clone)]
pub struct InMemoryDeadLetterStore {
    inner: Arc<RwLock<HashMap<EnvelopeId, DeadLetter>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, letter: DeadLetter) -> Result<bool, DeadLetterError> {
        let mut inner = self.inner.write();
        if inner.contains_key(&letter.envelope_id) {
            return Ok(false);
        }
        inner.insert(letter.envelope_id, letter);
        Ok(true)
    }

    async fn get(&self, envelope_id: &EnvelopeId) -> Result<Option<DeadLetter>, DeadLetterError> {
        Ok(self.inner.read().get(envelope_id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        Ok(sorted(self.inner.read().values().cloned().collect()))
    }

    async fn remove(&self, envelope_id: &EnvelopeId) -> Result<DeadLetter, DeadLetterError> {
        self.inner
            .write()
            .remove(envelope_id)
            .ok_or(DeadLetterError::NotFound(*envelope_id))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Insert { letter: DeadLetter },
    Remove { envelope_id: EnvelopeId },
}

struct Journal {
    file: tokio::fs::File,
    index: HashMap<EnvelopeId, DeadLetter>,
}

pub struct FileDeadLetterStore {
    path: PathBuf,
    journal: Mutex<Journal>,
}

impl FileDeadLetterStore {
    /// Open (or create) the journal at `path` and replay it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut index = HashMap::new();
        let mut needs_newline = false;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                needs_newline = !content.is_empty() && !content.ends_with('\n');
                for (line_no, line) in content.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JournalRecord>(line) {
                        Ok(JournalRecord::Insert { letter }) => {
                            index.entry(letter.envelope_id).or_insert(letter);
                        }
                        Ok(JournalRecord::Remove { envelope_id }) => {
                            index.remove(&envelope_id);
                        }
                        Err(e) => {
                            // A torn trailing write from a crash; skip it.
                            warn!(path = ?path, line = line_no + 1, error = %e, "skipping unreadable dead-letter record");
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if needs_newline {
            file.write_all(b"\n").await?;
        }

        info!(path = ?path, entries = index.len(), "opened dead-letter journal");

        Ok(Self {
            path,
            journal: Mutex::new(Journal { file, index }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(file: &mut tokio::fs::File, record: &JournalRecord) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for FileDeadLetterStore {
    async fn insert(&self, letter: DeadLetter) -> Result<bool, DeadLetterError> {
        let mut journal = self.journal.lock().await;
        if journal.index.contains_key(&letter.envelope_id) {
            return Ok(false);
        }
        let record = JournalRecord::Insert { letter };
        Self::append(&mut journal.file, &record).await?;
        if let JournalRecord::Insert { letter } = record {
            journal.index.insert(letter.envelope_id, letter);
        }
        Ok(true)
    }

    async fn get(&self, envelope_id: &EnvelopeId) -> Result<Option<DeadLetter>, DeadLetterError> {
        Ok(self.journal.lock().await.index.get(envelope_id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        Ok(sorted(self.journal.lock().await.index.values().cloned().collect()))
    }

    async fn remove(&self, envelope_id: &EnvelopeId) -> Result<DeadLetter, DeadLetterError> {
        let mut journal = self.journal.lock().await;
        if !journal.index.contains_key(envelope_id) {
            return Err(DeadLetterError::NotFound(*envelope_id));
        }
        Self::append(&mut journal.file, &JournalRecord::Remove { envelope_id: *envelope_id }).await?;
        journal
            .index
            .remove(envelope_id)
            .ok_or(DeadLetterError::NotFound(*envelope_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::envelope::{ConversationId, ReplyAddress, TenantId, TraceId};
    use crate::domain::errors::HandlerError;
    use crate::domain::reply::{ReplyOutcome, ReplyPayload};
    use chrono::Utc;

    fn letter() -> DeadLetter {
        let envelope_id = EnvelopeId::new();
        DeadLetter {
            envelope_id,
            reply_to: ReplyAddress::new("https://agent-b.internal/replies"),
            payload: ReplyPayload {
                envelope_id,
                trace_id: TraceId::new("t-1"),
                conversation_id: ConversationId::new("c-1"),
                tenant_id: TenantId::new("tenant-a"),
                tool_name: "db.get".to_string(),
                outcome: ReplyOutcome::Failure {
                    error: HandlerError::Failed("boom".into()),
                },
                completed_at: Utc::now(),
            },
            attempts: 5,
            last_error: "connection refused".to_string(),
            dead_lettered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn memory_store_inserts_once() {
        let store = InMemoryDeadLetterStore::new();
        let l = letter();
        assert!(store.insert(l.clone()).await.unwrap());
        assert!(!store.insert(l.clone()).await.unwrap());
        assert_eq!(store.len(), 1);

        let removed = store.remove(&l.envelope_id).await.unwrap();
        assert_eq!(removed, l);
        assert!(matches!(store.remove(&l.envelope_id).await, Err(DeadLetterError::NotFound(_))));
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq").join("dead-letters.jsonl");

        let kept = letter();
        let removed = letter();
        {
            let store = FileDeadLetterStore::open(&path).await.unwrap();
            assert!(store.insert(kept.clone()).await.unwrap());
            assert!(store.insert(removed.clone()).await.unwrap());
            assert!(!store.insert(kept.clone()).await.unwrap());
            store.remove(&removed.envelope_id).await.unwrap();
        }

        let reopened = FileDeadLetterStore::open(&path).await.unwrap();
        let all = reopened.list().await.unwrap();
        assert_eq!(all, vec![kept.clone()]);
        assert!(!reopened.insert(kept).await.unwrap());
    }

    #[tokio::test]
    async fn file_store_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead-letters.jsonl");
        let l = letter();
        {
            let store = FileDeadLetterStore::open(&path).await.unwrap();
            store.insert(l.clone()).await.unwrap();
        }
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"op\":\"insert\",\"letter\":{\"envelo");
        std::fs::write(&path, content).unwrap();

        let reopened = FileDeadLetterStore::open(&path).await.unwrap();
        assert_eq!(reopened.get(&l.envelope_id).await.unwrap(), Some(l));
    }
}
