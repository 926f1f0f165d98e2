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

/// A prompt sent to the peer asking whether a request should be allowed.
/// `id` is assigned by [`AskChannel`](super::AskChannel) from a
/// monotonically increasing per-process counter, not by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub id: u64,
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AskAction {
    Allow,
    Block,
}

/// The peer's answer to an [`AskRequest`], matched back by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub id: u64,
    pub action: AskAction,
    /// if true, the decision should be cached (treated like a remembered
    /// host-scoped allow/block rule) instead of asked again next time.
    #[serde(default)]
    pub remember: bool,
    /// reserved for a future "never ask again for this host" semantics;
    /// currently folded into the same cache entry as `remember`.
    #[serde(default)]
    pub permanent: bool,
}

impl AskResponse {
    pub fn allow(&self) -> bool {
        self.action == AskAction::Allow
    }
}

/// Wire envelope. Both roles may send either variant: a request when they
/// need a decision, a response when answering one the peer sent. Unknown
/// fields on either variant are ignored by serde's default behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AskFrame {
    Request(AskRequest),
    Response(AskResponse),
}
