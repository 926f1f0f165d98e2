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

use serde::{Deserialize, Serialize};

// one injector entry, keyed by name in CredentialsConfig::injectors (e.g. "github")
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialEntryConfig {
    pub enabled: Option<bool>,
    pub env: Option<String>,
    pub host: Option<String>,
}

impl CredentialEntryConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn get_env(&self) -> Option<&String> {
        self.env.as_ref()
    }

    pub fn get_host(&self) -> Option<&String> {
        self.host.as_ref()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialsConfig {
    // BTreeMap so injector construction in CredentialRegistry::from_config
    // iterates names in sorted order, matching the build order guarantee.
    #[serde(flatten)]
    pub injectors: BTreeMap<String, CredentialEntryConfig>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        CredentialsConfig {
            injectors: BTreeMap::new(),
        }
    }
}
