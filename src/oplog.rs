/*!
 * Per-node operation log
 *
 * Every command start and end, selected command output, free-form lines and
 * faults are written as one record each, either human-readable text or JSON
 * Lines. The log is cheap to clone; clones share the sink.
 *
 * # Example
 *
 * ```
 * use hive_proxy::config::LogFormat;
 * use hive_proxy::oplog::OperationLog;
 *
 * let log = OperationLog::in_memory(LogFormat::Text);
 * log.line("worker-0", "installing packages").unwrap();
 * assert!(log.contents().unwrap().contains("installing packages"));
 * ```
 */

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::LogFormat;
use crate::error::{ProxyError, Result};

/// Kind of operation log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Start,
    End,
    Stdout,
    Stderr,
    Line,
    Fault,
}

impl RecordKind {
    fn label(&self) -> &'static str {
        match self {
            RecordKind::Start => "START",
            RecordKind::End => "END",
            RecordKind::Stdout => "STDOUT",
            RecordKind::Stderr => "STDERR",
            RecordKind::Line => "LOG",
            RecordKind::Fault => "FAULT",
        }
    }
}

/// One operation log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// RFC 3339 timestamp
    pub timestamp: String,

    pub node: String,

    pub kind: RecordKind,

    /// Command text, or the redaction token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Output, free-form line or fault message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl OperationRecord {
    pub fn new(node: &str, kind: RecordKind) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            node: node.to_string(),
            kind,
            command: None,
            exit_code: None,
            duration_ms: None,
            text: None,
        }
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    /// Human-readable rendering, possibly spanning several lines
    fn to_text(&self) -> String {
        let mut line = format!("{} [{}] {}:", self.timestamp, self.node, self.kind.label());
        if let Some(command) = &self.command {
            line.push(' ');
            line.push_str(command);
        }
        if let Some(exit_code) = self.exit_code {
            line.push_str(&format!(" [exitcode={}]", exit_code));
        }
        if let Some(duration_ms) = self.duration_ms {
            line.push_str(&format!(" ({} ms)", duration_ms));
        }
        if let Some(text) = &self.text {
            match self.kind {
                RecordKind::Stdout | RecordKind::Stderr => {
                    for output_line in text.lines() {
                        line.push_str("\n    ");
                        line.push_str(output_line);
                    }
                }
                _ => {
                    line.push(' ');
                    line.push_str(text);
                }
            }
        }
        line
    }
}

/// In-memory sink whose contents can be read back
#[derive(Debug, Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Operation log shared by a proxy and its clones
#[derive(Clone)]
pub struct OperationLog {
    format: LogFormat,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    buffer: Option<SharedBuffer>,
}

impl std::fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationLog")
            .field("format", &self.format)
            .field("in_memory", &self.buffer.is_some())
            .finish()
    }
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::discard()
    }
}

impl OperationLog {
    /// Write records to any sink
    pub fn new(writer: impl Write + Send + 'static, format: LogFormat) -> Self {
        Self {
            format,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            buffer: None,
        }
    }

    /// Append records to a file, creating it and its folder if needed
    pub fn to_file(path: &Path, format: LogFormat) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file), format))
    }

    /// Keep records in memory; read them back with [`contents`](Self::contents)
    pub fn in_memory(format: LogFormat) -> Self {
        let buffer = SharedBuffer::default();
        Self {
            format,
            writer: Arc::new(Mutex::new(Box::new(buffer.clone()))),
            buffer: Some(buffer),
        }
    }

    /// Drop every record
    pub fn discard() -> Self {
        Self::new(io::sink(), LogFormat::Text)
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Everything written so far, for in-memory logs
    pub fn contents(&self) -> Option<String> {
        self.buffer.as_ref().map(|buffer| {
            let data = buffer.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            String::from_utf8_lossy(&data).into_owned()
        })
    }

    /// Write one record and flush
    pub fn emit(&self, record: &OperationRecord) -> Result<()> {
        let rendered = match self.format {
            LogFormat::Json => serde_json::to_string(record)
                .map_err(|e| ProxyError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?,
            LogFormat::Text => record.to_text(),
        };

        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(writer, "{}", rendered)?;
        writer.flush()?;
        Ok(())
    }

    pub fn command_start(&self, node: &str, command: &str) -> Result<()> {
        self.emit(&OperationRecord::new(node, RecordKind::Start).with_command(command))
    }

    pub fn command_end(&self, node: &str, command: &str, exit_code: i32, duration: Duration) -> Result<()> {
        self.emit(
            &OperationRecord::new(node, RecordKind::End)
                .with_command(command)
                .with_exit_code(exit_code)
                .with_duration(duration),
        )
    }

    /// Log captured output; empty output is skipped
    pub fn output(&self, node: &str, kind: RecordKind, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.emit(&OperationRecord::new(node, kind).with_text(text))
    }

    pub fn line(&self, node: &str, text: &str) -> Result<()> {
        self.emit(&OperationRecord::new(node, RecordKind::Line).with_text(text))
    }

    pub fn fault(&self, node: &str, message: &str) -> Result<()> {
        self.emit(&OperationRecord::new(node, RecordKind::Fault).with_text(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_text_records() {
        let log = OperationLog::in_memory(LogFormat::Text);
        log.command_start("worker-0", "ls -l").unwrap();
        log.output("worker-0", RecordKind::Stderr, "first\nsecond").unwrap();
        log.command_end("worker-0", "ls -l", 2, Duration::from_millis(15))
            .unwrap();

        let contents = log.contents().unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert!(lines[0].ends_with("[worker-0] START: ls -l"));
        assert!(lines[1].ends_with("[worker-0] STDERR:"));
        assert_eq!(lines[2], "    first");
        assert_eq!(lines[3], "    second");
        assert!(lines[4].ends_with("END: ls -l [exitcode=2] (15 ms)"));
    }

    #[test]
    fn test_json_lines() {
        let log = OperationLog::in_memory(LogFormat::Json);
        log.fault("worker-0", "disk full").unwrap();
        log.line("worker-0", "hello").unwrap();

        let contents = log.contents().unwrap();
        let records: Vec<OperationRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, RecordKind::Fault);
        assert_eq!(records[0].text.as_deref(), Some("disk full"));
        assert!(!contents.contains("exit_code"));
    }

    #[test]
    fn test_empty_output_skipped() {
        let log = OperationLog::in_memory(LogFormat::Text);
        log.output("worker-0", RecordKind::Stdout, "  \n").unwrap();
        assert_eq!(log.contents().unwrap(), "");
    }

    #[test]
    fn test_clones_share_sink() {
        let log = OperationLog::in_memory(LogFormat::Text);
        let clone = log.clone();
        clone.line("worker-1", "from clone").unwrap();
        assert!(log.contents().unwrap().contains("from clone"));
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("worker-0.log");

        OperationLog::to_file(&path, LogFormat::Text)
            .unwrap()
            .line("worker-0", "one")
            .unwrap();
        OperationLog::to_file(&path, LogFormat::Text)
            .unwrap()
            .line("worker-0", "two")
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_discard() {
        let log = OperationLog::discard();
        log.line("worker-0", "nothing").unwrap();
        assert!(log.contents().is_none());
    }
}
