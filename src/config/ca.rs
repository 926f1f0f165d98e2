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

// certificate authority config
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaConfig {
    // directory holding ca.crt / ca.key
    pub dir: Option<String>,
}

impl CaConfig {
    pub fn get_dir(&self) -> Option<&String> {
        self.dir.as_ref()
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        CaConfig { dir: None }
    }
}
