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

// ask channel config
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AskConfig {
    pub timeout_secs: Option<u64>,
    pub socket_path: Option<String>,
}

impl AskConfig {
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(30)
    }

    pub fn get_socket_path(&self) -> Option<&String> {
        self.socket_path.as_ref()
    }
}

impl Default for AskConfig {
    fn default() -> Self {
        AskConfig {
            timeout_secs: None,
            socket_path: None,
        }
    }
}
