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
use std::sync::Arc;

use uuid::Uuid;

use super::record::{redact_always, RequestLogRecord};
use super::remote::{derive_log_level, NoopRemoteLogWriter, RemoteLogWriter};
use super::writer::RotatingLogWriter;

/// Everything one call to [`RequestLogger::record`] needs to build a
/// [`RequestLogRecord`]. Grouped into a struct because the record has too
/// many independently-optional fields for a readable positional call.
pub struct RecordFields<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub request_headers: &'a BTreeMap<String, String>,
    pub request_body: Option<String>,
    pub status: Option<u16>,
    pub response_headers: &'a BTreeMap<String, String>,
    pub response_body: Option<String>,
    pub duration: std::time::Duration,
    pub error: Option<String>,
    pub filter_action: &'a str,
    pub filter_reason: &'a str,
    pub matched_rule: Option<String>,
    pub credential_injected: Option<String>,
    pub redaction_action: Option<String>,
    pub redaction_rules_applied: Vec<String>,
}

/// Captures request/response pairs, strips always-redacted headers,
/// writes one JSON line per record to the rotating log, and optionally
/// forwards the same record to a remote sink at a level derived from the
/// response status.
pub struct RequestLogger {
    writer: RotatingLogWriter,
    remote: Arc<dyn RemoteLogWriter>,
}

impl RequestLogger {
    pub fn new(writer: RotatingLogWriter, remote: Arc<dyn RemoteLogWriter>) -> RequestLogger {
        RequestLogger { writer, remote }
    }

    pub fn without_remote(writer: RotatingLogWriter) -> RequestLogger {
        RequestLogger {
            writer,
            remote: Arc::new(NoopRemoteLogWriter),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(&self, fields: RecordFields<'_>) {
        let record = RequestLogRecord {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            method: fields.method.to_string(),
            url: fields.url.to_string(),
            host: fields.host.to_string(),
            path: fields.path.to_string(),
            request_headers: redact_always(fields.request_headers),
            request_body: fields.request_body,
            status: fields.status,
            response_headers: redact_always(fields.response_headers),
            response_body: fields.response_body,
            duration_ms: fields.duration.as_millis() as u64,
            error: fields.error,
            filter_action: fields.filter_action.to_string(),
            filter_reason: fields.filter_reason.to_string(),
            matched_rule: fields.matched_rule,
            credential_injected: fields.credential_injected,
            redaction_action: fields.redaction_action,
            redaction_rules_applied: fields.redaction_rules_applied,
        };

        if let Ok(line) = serde_json::to_string(&record) {
            if let Err(err) = self.writer.append_line(&line).await {
                tracing::warn!(error = %err, "failed to write request log record");
            }
        }

        let level = derive_log_level(&record);
        self.remote.send(level, &record).await;
    }
}
