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

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::writer::RotatingLogWriter;

#[derive(Serialize)]
struct WarningRecord {
    timestamp: DateTime<Utc>,
    message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    fields: BTreeMap<String, String>,
}

/// Durable counterpart to the stdout tracing subscriber: every intra-proxy
/// warning (failed accepts, cert minting failures, upstream forward
/// failures, ask channel errors) is also appended here as a JSON line, so
/// a sandbox run can be audited after the terminal is gone.
pub struct WarningLog {
    writer: RotatingLogWriter,
}

impl WarningLog {
    pub fn new(writer: RotatingLogWriter) -> WarningLog {
        WarningLog { writer }
    }

    pub async fn warn(&self, message: &str, fields: BTreeMap<String, String>) {
        let record = WarningRecord {
            timestamp: Utc::now(),
            message: message.to_string(),
            fields,
        };
        if let Ok(line) = serde_json::to_string(&record) {
            if let Err(err) = self.writer.append_line(&line).await {
                tracing::error!(error = %err, "failed to write proxy warning log record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn appends_one_json_line_per_warning() {
        let dir = tempdir().unwrap();
        let writer = RotatingLogWriter::open(dir.path(), "proxy", ".log", 1024 * 1024, 5)
            .await
            .unwrap();
        let log = WarningLog::new(writer);

        let mut fields = BTreeMap::new();
        fields.insert("host".to_string(), "example.com".to_string());
        log.warn("upstream forward failed", fields).await;

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1);
        let contents = std::fs::read_to_string(dir.path().join(&names[0])).unwrap();
        assert!(contents.contains("upstream forward failed"));
        assert!(contents.contains("example.com"));
    }
}
