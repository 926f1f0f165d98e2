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

// the action a filter rule or default policy resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Block,
    Ask,
}

// what part of the request a rule's pattern is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Host,
    Path,
    Url,
}

// one filter rule as written in yaml. the pattern's type (exact/glob/regex)
// is auto-detected from its shape unless explicitly given.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterRuleConfig {
    pub pattern: String,
    pub scope: RuleScope,
    pub action: RuleAction,
    #[serde(default)]
    pub kind: Option<PatternKind>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Exact,
    Glob,
    Regex,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub default_action: Option<RuleAction>,
    #[serde(default)]
    pub cache_decisions: Option<bool>,
    #[serde(default)]
    pub rules: Vec<FilterRuleConfig>,
}

impl FilterConfig {
    pub fn default_action(&self) -> RuleAction {
        self.default_action.unwrap_or(RuleAction::Allow)
    }

    pub fn cache_decisions(&self) -> bool {
        self.cache_decisions.unwrap_or(true)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            default_action: None,
            cache_decisions: None,
            rules: Vec::new(),
        }
    }
}
