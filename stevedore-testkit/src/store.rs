use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use stevedore::{ObjectStore, ObjectSummary};

#[derive(Clone)]
struct StoredObject {
    bucket: String,
    key: String,
    last_modified: DateTime<Utc>,
    body: Vec<u8>,
}

/// In-memory object store for captured run logs.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<Mutex<Vec<StoredObject>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object body under a bucket and key.
    pub fn put_object(&self, bucket: &str, key: &str, last_modified: DateTime<Utc>, body: &[u8]) {
        self.objects.lock().push(StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            last_modified,
            body: body.to_vec(),
        });
    }

    /// Append JSON-line framed log lines to a fresh object.
    pub fn put_log_lines(
        &self,
        bucket: &str,
        key: &str,
        last_modified: DateTime<Utc>,
        lines: &[&str],
    ) {
        let mut body = Vec::new();
        for line in lines {
            let framed = serde_json::json!({
                "log": format!("{line}\n"),
                "stream": "stdout",
                "time": last_modified.to_rfc3339(),
            });
            body.extend_from_slice(framed.to_string().as_bytes());
            body.push(b'\n');
        }
        self.put_object(bucket, key, last_modified, &body);
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> anyhow::Result<Vec<ObjectSummary>> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|object| object.bucket == bucket && object.key.starts_with(prefix))
            .map(|object| ObjectSummary {
                key: object.key.clone(),
                last_modified: object.last_modified,
            })
            .collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        self.objects
            .lock()
            .iter()
            .find(|object| object.bucket == bucket && object.key == key)
            .map(|object| object.body.clone())
            .ok_or_else(|| anyhow::anyhow!("no such object: {bucket}/{key}"))
    }
}
