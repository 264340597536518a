//! JSON Lines result sink

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use dispatcher::{ResultSink, SinkError, TaskReport};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Appends one JSON object per finished task to a file.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|source| Error::Output {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for JsonlSink {
    fn write<'a>(
        &'a self,
        report: &'a TaskReport,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let mut line =
                serde_json::to_vec(report).map_err(|e| SinkError(format!("serialize: {e}")))?;
            line.push(b'\n');

            let mut file = self.file.lock().await;
            file.write_all(&line)
                .await
                .map_err(|e| SinkError(format!("write {}: {e}", self.path.display())))?;
            file.flush()
                .await
                .map_err(|e| SinkError(format!("flush {}: {e}", self.path.display())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatcher::CallRecord;

    fn report(task: &str) -> TaskReport {
        TaskReport {
            task: task.to_string(),
            attempts: 1,
            finished_at_ms: 1_700_000_000_000,
            calls: vec![CallRecord {
                kind: "search".into(),
                cost: 100,
                body: serde_json::json!({ "items": [{ "id": "abc" }] }),
            }],
        }
    }

    #[tokio::test]
    async fn appends_one_line_per_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        std::fs::write(&path, "{\"task\":\"earlier run\"}\n").unwrap();

        let sink = JsonlSink::open(&path).await.unwrap();
        sink.write(&report("lofi")).await.unwrap();
        sink.write(&report("jazz")).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3, "existing results are kept");
        assert_eq!(lines[1]["task"], "lofi");
        assert_eq!(lines[2]["calls"][0]["kind"], "search");
        assert_eq!(lines[2]["calls"][0]["body"]["items"][0]["id"], "abc");
    }

    #[tokio::test]
    async fn unopenable_path_is_an_output_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonlSink::open(&dir.path().join("missing/results.jsonl"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Output { .. }));
    }
}
