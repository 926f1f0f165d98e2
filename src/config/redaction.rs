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

// severity of a redaction rule, highest precedence first: block > redact > log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionAction {
    Log,
    Redact,
    Block,
}

// one redaction rule as written in yaml. either `pattern` (a regex, matched
// directly) or one of the source fields is set; when multiple source
// fields are present, `value` wins over `env` over `file` over
// `env_file_key`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedactionRuleConfig {
    pub name: String,
    #[serde(default)]
    pub action: Option<RedactionAction>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub env_file_key: Option<String>,
}

impl RedactionRuleConfig {
    pub fn action(&self) -> RedactionAction {
        self.action.unwrap_or(RedactionAction::Redact)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RedactionConfig {
    #[serde(default)]
    pub rules: Vec<RedactionRuleConfig>,
    /// bounded recursive search depth for `env_file_key` sources, from the
    /// process's current directory. Default 3 per the component spec.
    #[serde(default)]
    pub env_file_search_depth: Option<usize>,
}

impl RedactionConfig {
    pub fn env_file_search_depth(&self) -> usize {
        self.env_file_search_depth.unwrap_or(3)
    }
}
