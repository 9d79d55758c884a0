//! Per-request audit logging.
//!
//! An [`AccessLog`] is built by middleware as the request context
//! loads: the method and URL come from the request, one accessor is
//! recorded per authenticated token. Handlers then call [`AccessLog::log`]
//! with the touched resources and fields. Records are JSON lines,
//! buffered up to a configurable size and flushed on drop, so a log is
//! never shared across requests.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
#[error("access log sink error: {0}")]
pub struct Error(#[from] std::io::Error);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Accessor {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
}

impl Accessor {
    pub fn client(id: impl Into<String>) -> Accessor {
        Accessor {
            kind: "client",
            id: id.into(),
        }
    }
}

/// One resource touched by a request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
struct Record<'a> {
    accessors: &'a [Accessor],
    http_method: &'a str,
    url: &'a str,
    reason: Option<&'a str>,
    timestamp: String,
    transaction_id: Option<i64>,
    resources: &'a [Resource],
    fields: &'a [String],
}

/// Where flushed records go.
pub trait Sink: Send {
    fn write(&mut self, lines: &[String]) -> Result<(), Error>;
}

pub struct StdoutSink;

impl Sink for StdoutSink {
    fn write(&mut self, lines: &[String]) -> Result<(), Error> {
        use std::io::Write;
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        for line in lines {
            writeln!(handle, "{line}")?;
        }
        Ok(())
    }
}

pub struct FileSink {
    file: std::fs::File,
}

impl FileSink {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<FileSink, Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(FileSink { file })
    }
}

impl Sink for FileSink {
    fn write(&mut self, lines: &[String]) -> Result<(), Error> {
        use std::io::Write;
        for line in lines {
            writeln!(self.file, "{line}")?;
        }
        self.file.flush()?;
        Ok(())
    }
}

/// A sink that drops everything; used when auditing is disabled.
pub struct NullSink;

impl Sink for NullSink {
    fn write(&mut self, _: &[String]) -> Result<(), Error> {
        Ok(())
    }
}

pub struct AccessLog {
    accessors: Vec<Accessor>,
    method: String,
    url: String,
    buffer: Vec<String>,
    buffer_size: usize,
    sink: Box<dyn Sink>,
}

impl AccessLog {
    pub fn new(sink: Box<dyn Sink>, buffer_size: usize) -> AccessLog {
        AccessLog {
            accessors: Vec::new(),
            method: String::new(),
            url: String::new(),
            buffer: Vec::new(),
            buffer_size: buffer_size.max(1),
            sink,
        }
    }

    /// Record the request this log is bound to.
    pub fn request(&mut self, method: &str, url: &str) {
        self.method = method.to_string();
        self.url = url.to_string();
    }

    /// Record an authenticated accessor; called once per token as the
    /// context loads.
    pub fn accessor(&mut self, accessor: Accessor) {
        self.accessors.push(accessor);
    }

    /// Append one audit record.
    pub fn log(
        &mut self,
        txn: Option<i64>,
        method: Option<&str>,
        reason: Option<&str>,
        resources: &[Resource],
        fields: &[String],
    ) {
        let record = Record {
            accessors: &self.accessors,
            http_method: method.unwrap_or(&self.method),
            url: &self.url,
            reason,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            transaction_id: txn,
            resources,
            fields,
        };
        let line = serde_json::to_string(&record).expect("record is serializable");
        self.buffer.push(line);
        if self.buffer.len() >= self.buffer_size {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(err) = self.sink.write(&self.buffer) {
            tracing::error!(%err, "failed to flush access log");
        }
        self.buffer.clear();
    }
}

impl Drop for AccessLog {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MemorySink(Arc<Mutex<Vec<String>>>);

    impl Sink for MemorySink {
        fn write(&mut self, lines: &[String]) -> Result<(), Error> {
            self.0.lock().unwrap().extend_from_slice(lines);
            Ok(())
        }
    }

    #[test]
    fn test_record_shape() {
        let sink = MemorySink::default();
        let mut log = AccessLog::new(Box::new(sink.clone()), 8);
        log.request("GET", "https://data.example/country?sort(+code)");
        log.accessor(Accessor::client("client-one"));
        log.log(
            Some(42),
            None,
            Some("getall"),
            &[Resource {
                kind: "model",
                name: "country".into(),
                id: None,
            }],
            &["code".to_string(), "title".to_string()],
        );
        drop(log);

        let lines = sink.0.lock().unwrap();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(record["http_method"], "GET");
        assert_eq!(record["transaction_id"], 42);
        assert_eq!(record["accessors"][0]["type"], "client");
        assert_eq!(record["accessors"][0]["id"], "client-one");
        assert_eq!(record["resources"][0]["name"], "country");
        assert_eq!(record["fields"], serde_json::json!(["code", "title"]));
        assert!(record["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_buffer_flushes_when_full() {
        let sink = MemorySink::default();
        let mut log = AccessLog::new(Box::new(sink.clone()), 2);
        log.request("GET", "/country");
        log.log(None, None, None, &[], &[]);
        assert_eq!(sink.0.lock().unwrap().len(), 0);
        log.log(None, None, None, &[], &[]);
        assert_eq!(sink.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        {
            let mut log =
                AccessLog::new(Box::new(FileSink::open(&path).unwrap()), 16);
            log.request("POST", "/country");
            log.log(None, None, Some("insert"), &[], &[]);
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
