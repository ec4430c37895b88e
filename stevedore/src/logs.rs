use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::{BufRead, Write};

use crate::config::LogStoreConfig;
use crate::error::{ConfigError, LogsError};
use crate::run::Run;

/// Summary of one stored log object.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectSummary {
    /// Object key.
    pub key: String,
    /// Last-modified timestamp; retried pods write newer objects.
    pub last_modified: DateTime<Utc>,
}

/// Shared handle onto the object store holding captured run logs.
///
/// Consumed, never implemented here; the surrounding service injects the
/// real client.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List objects under a key prefix.
    async fn list_objects(&self, bucket: &str, prefix: &str)
        -> anyhow::Result<Vec<ObjectSummary>>;

    /// Fetch an object's full body.
    async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// One line of the JSON-line log framing written by the log sidecar.
/// Only the log payload is consumed; stream and time are left in the raw
/// object.
#[derive(Debug, Deserialize)]
struct LogLine {
    log: String,
}

/// Enumerates, selects, and paginates the log objects of a run.
///
/// Logs land under `<root>/<run_id>/<file>` with the run id embedded in the
/// file name; pod retries append new objects, and the most recently written
/// one is authoritative. The pagination cursor is a line offset encoded as
/// a string, opaque to callers.
#[derive(Clone, Debug)]
pub struct LogTailer<S> {
    store: S,
    bucket: String,
    root_dir: String,
    max_log_lines: i64,
}

impl<S: ObjectStore> LogTailer<S> {
    /// Validate the log-store configuration and build a tailer over the
    /// injected object store.
    ///
    /// `default_region` is the process-wide AWS region the configuration
    /// falls back to; region resolution happens here even though the store
    /// client itself is constructed by the caller.
    pub fn new(
        store: S,
        config: &LogStoreConfig,
        default_region: Option<&str>,
    ) -> Result<Self, ConfigError> {
        config.validate(default_region)?;
        Ok(Self {
            store,
            bucket: config.bucket_name.clone(),
            root_dir: config.root_dir.clone(),
            max_log_lines: config.max_log_lines,
        })
    }

    /// Name of this log client.
    pub fn name(&self) -> &'static str {
        "k8s-s3"
    }

    /// Read the next page of logs for a run.
    ///
    /// `last_seen` is the cursor returned by the previous call; missing or
    /// unparseable cursors mean "from the beginning". Returns the
    /// concatenated log text and the advanced cursor. Malformed lines are
    /// skipped but still advance the cursor.
    pub async fn logs(
        &self,
        run: &Run,
        last_seen: Option<&str>,
    ) -> Result<(String, String), LogsError> {
        let body = self.latest_object(run).await?;
        let starting_position = last_seen
            .and_then(|cursor| cursor.parse::<i64>().ok())
            .filter(|position| *position > 0)
            .unwrap_or(0);

        let (text, position) = paginate(&body, starting_position, self.max_log_lines);
        Ok((text, position.to_string()))
    }

    /// Stream the entire latest log object into a byte sink, in order,
    /// without pagination. Unlike the paginated read, a malformed line is
    /// an error here.
    pub async fn write_all_logs(
        &self,
        run: &Run,
        sink: &mut (dyn Write + Send),
    ) -> Result<(), LogsError> {
        let body = self.latest_object(run).await?;
        let mut reader = std::io::BufReader::new(body.as_slice());
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(());
            }
            let parsed: LogLine = serde_json::from_slice(&line)?;
            sink.write_all(parsed.log.as_bytes())?;
        }
    }

    /// Fetch the body of the latest log object associated with the run.
    async fn latest_object(&self, run: &Run) -> Result<Vec<u8>, LogsError> {
        // Pod isn't there yet; callers map this to "no logs", not a hard
        // failure.
        if run.pod_name.is_none() {
            return Err(LogsError::NoLogs(run.run_id.clone()));
        }

        let prefix = format!("{}/{}", self.root_dir, run.run_id);
        let objects = self
            .store
            .list_objects(&self.bucket, &prefix)
            .await
            .map_err(LogsError::Store)?;

        let mut latest: Option<&ObjectSummary> = None;
        for object in &objects {
            if !object.key.contains(&run.run_id) {
                continue;
            }
            if latest.is_none_or(|best| best.last_modified < object.last_modified) {
                latest = Some(object);
            }
        }

        match latest {
            Some(object) => self
                .store
                .get_object(&self.bucket, &object.key)
                .await
                .map_err(LogsError::Store),
            None => Err(LogsError::NoLogs(run.run_id.clone())),
        }
    }
}

/// Walk a JSON-line body from a line offset, collecting log payloads.
///
/// Returns the concatenated text and the line position reached, which is
/// the next call's starting offset. Sequential calls therefore produce a
/// line-aligned prefix of the object.
fn paginate(body: &[u8], starting_position: i64, max_lines: i64) -> (String, i64) {
    let mut acc = String::new();
    let mut reader = std::io::BufReader::new(body);
    let mut line = Vec::new();
    let mut current = 0i64;

    // Discard everything before the cursor.
    while current < starting_position {
        current += 1;
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => return (acc, starting_position),
            Ok(_) => {}
        }
    }

    while current <= starting_position + max_lines {
        current += 1;
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => return (acc, current),
            Ok(_) => {
                if let Ok(parsed) = serde_json::from_slice::<LogLine>(&line) {
                    acc.push_str(&parsed.log);
                }
            }
        }
    }

    (acc, current)
}
