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

use serde::{Deserialize, Serialize};

// rotating request log config
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    pub dir: Option<String>,
    pub max_segment_bytes: Option<u64>,
    pub max_files: Option<usize>,
}

impl LogConfig {
    pub fn get_dir(&self) -> Option<&String> {
        self.dir.as_ref()
    }

    pub fn max_segment_bytes(&self) -> u64 {
        self.max_segment_bytes.unwrap_or(50 * 1024 * 1024)
    }

    pub fn max_files(&self) -> usize {
        self.max_files.unwrap_or(5)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            dir: None,
            max_segment_bytes: None,
            max_files: None,
        }
    }
}

// remote log forwarding config. the concrete syslog/otlp writers are
// collaborator-owned; this crate only defines the trait boundary and a
// file-fanout fallback.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteLogConfig {
    pub enabled: Option<bool>,
}

impl RemoteLogConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

impl Default for RemoteLogConfig {
    fn default() -> Self {
        RemoteLogConfig { enabled: None }
    }
}
