use super::{BatchSink, SinkReceipt};
use crate::model::{field_as_string, ExtractionRequest, Record};
use async_trait::async_trait;
use extractor_core::{DuplicatePolicy, Error, Result};
use std::collections::HashSet;
use tokio::sync::Mutex;

/// In-process sink keeping every batch it receives. Duplicates are judged
/// by the request's key field within the same source, scope and entity;
/// records without that field are never duplicates.
pub struct MemorySink {
    policy: DuplicatePolicy,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    batches: Vec<Vec<Record>>,
    keys: HashSet<String>,
}

impl MemorySink {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Every batch received, in call order, as written (duplicates removed).
    pub async fn batches(&self) -> Vec<Vec<Record>> {
        self.state.lock().await.batches.clone()
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.batches.iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn sink(&self, request: &ExtractionRequest, records: &[Record]) -> Result<SinkReceipt> {
        let mut state = self.state.lock().await;
        let prefix = format!("{}:{}:{}:", request.source, request.scope(), request.entity);

        let mut fresh_keys = HashSet::new();
        let mut written = Vec::with_capacity(records.len());
        let mut duplicates = 0;

        for record in records {
            let key = field_as_string(record, &request.key_field).map(|k| format!("{prefix}{k}"));
            let seen = key
                .as_ref()
                .is_some_and(|k| state.keys.contains(k) || fresh_keys.contains(k));

            if seen {
                match self.policy {
                    DuplicatePolicy::Skip => {
                        duplicates += 1;
                        continue;
                    }
                    DuplicatePolicy::Fail => {
                        return Err(Error::SinkWrite(format!(
                            "duplicate {} '{}' for {} {}",
                            request.key_field,
                            key.unwrap_or_default(),
                            request.scope(),
                            request.entity
                        )));
                    }
                }
            }

            if let Some(key) = key {
                fresh_keys.insert(key);
            }
            written.push(record.clone());
        }

        state.keys.extend(fresh_keys);
        let receipt = SinkReceipt {
            written: written.len(),
            duplicates,
        };
        state.batches.push(written);

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceKind;
    use serde_json::json;

    fn request() -> ExtractionRequest {
        ExtractionRequest::builder(SourceKind::Github, "octo", "issues", "/repos/{owner}/{repo}/issues")
            .repo("hello")
            .build()
            .unwrap()
    }

    fn record(id: u64) -> Record {
        json!({ "id": id }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn skip_policy_drops_known_keys() {
        let sink = MemorySink::new(DuplicatePolicy::Skip);
        let request = request();

        let first = sink.sink(&request, &[record(1), record(2)]).await.unwrap();
        assert_eq!(first, SinkReceipt { written: 2, duplicates: 0 });

        let second = sink.sink(&request, &[record(2), record(3), record(3)]).await.unwrap();
        assert_eq!(second, SinkReceipt { written: 1, duplicates: 2 });
        assert_eq!(sink.record_count().await, 3);
    }

    #[tokio::test]
    async fn fail_policy_rejects_whole_batch() {
        let sink = MemorySink::new(DuplicatePolicy::Fail);
        let request = request();

        sink.sink(&request, &[record(1)]).await.unwrap();
        let err = sink.sink(&request, &[record(2), record(1)]).await.unwrap_err();
        assert!(matches!(err, Error::SinkWrite(_)));

        // Nothing from the rejected batch was kept.
        assert_eq!(sink.batches().await.len(), 1);
        assert_eq!(sink.record_count().await, 1);
    }

    #[tokio::test]
    async fn keys_are_scoped_per_entity() {
        let sink = MemorySink::new(DuplicatePolicy::Fail);
        let issues = request();
        let pulls = ExtractionRequest::builder(SourceKind::Github, "octo", "pulls", "/repos/{owner}/{repo}/pulls")
            .repo("hello")
            .build()
            .unwrap();

        sink.sink(&issues, &[record(1)]).await.unwrap();
        sink.sink(&pulls, &[record(1)]).await.unwrap();
        assert_eq!(sink.record_count().await, 2);
    }
}
