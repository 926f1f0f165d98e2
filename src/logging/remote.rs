/**
 * This file is part of devsandbox-proxy.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use async_trait::async_trait;

use super::record::RequestLogRecord;

/// Severity derived from a record, used to pick the right remote log
/// level. The concrete syslog/OTLP writers that interpret this are owned
/// by the enclosing sandbox; this crate only defines the boundary and a
/// couple of stand-ins so the proxy is runnable on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// error if the entry has a non-empty error, warn if the filter or
/// redaction action is `block` or the status is >= 400, info otherwise.
pub fn derive_log_level(record: &RequestLogRecord) -> LogLevel {
    if record.error.as_deref().is_some_and(|e| !e.is_empty()) {
        return LogLevel::Error;
    }
    let blocked = record.filter_action == "block" || record.redaction_action.as_deref() == Some("block");
    if blocked || record.status.map(|s| s >= 400).unwrap_or(false) {
        return LogLevel::Warn;
    }
    LogLevel::Info
}

#[async_trait]
pub trait RemoteLogWriter: Send + Sync {
    async fn send(&self, level: LogLevel, record: &RequestLogRecord);
}

/// Used when remote forwarding is disabled in configuration.
pub struct NoopRemoteLogWriter;

#[async_trait]
impl RemoteLogWriter for NoopRemoteLogWriter {
    async fn send(&self, _level: LogLevel, _record: &RequestLogRecord) {}
}

/// A minimal stand-in for a real remote sink: fans records out to a
/// second local file as newline-delimited JSON, so deployments that
/// haven't wired a syslog/OTLP collaborator yet still get a durable,
/// independently rotatable copy of "would have been forwarded" traffic.
pub struct FileFanoutRemoteLogWriter {
    writer: super::writer::RotatingLogWriter,
}

impl FileFanoutRemoteLogWriter {
    pub async fn open(dir: &std::path::Path) -> Result<FileFanoutRemoteLogWriter, std::io::Error> {
        let writer =
            super::writer::RotatingLogWriter::open(dir, "remote", ".jsonl", 50 * 1024 * 1024, 5).await?;
        Ok(FileFanoutRemoteLogWriter { writer })
    }
}

#[async_trait]
impl RemoteLogWriter for FileFanoutRemoteLogWriter {
    async fn send(&self, level: LogLevel, record: &RequestLogRecord) {
        if let Ok(line) = serde_json::to_string(&(level_name(level), record)) {
            let _ = self.writer.append_line(&line).await;
        }
    }
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}
