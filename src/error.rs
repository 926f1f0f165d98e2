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

use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors raised while loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid filter rule {pattern:?}: {reason}")]
    InvalidFilterRule { pattern: String, reason: String },

    #[error("invalid regex pattern {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("redaction rule {name:?} has no resolvable source")]
    UnresolvableRedactionSource { name: String },

    #[error("redaction rule {name:?}: {reason}")]
    InvalidRedactionRule { name: String, reason: String },

    #[error("ca directory {path:?} is not writable: {source}")]
    CaDirNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("credential injector {injector:?} token collides with redaction rule {rule:?}")]
    CredentialRedactionConflict { injector: String, rule: String },
}

/// Errors surfaced while the proxy is running, split into startup-fatal
/// and per-request categories per the component's own recovery story.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create log directory {path:?}: {source}")]
    LogDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate authority error: {0}")]
    Ca(#[from] crate::ca::CaError),

    #[error("upstream connect error for {host}: {source}")]
    UpstreamConnect {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream tls handshake failed for {host}: {source}")]
    UpstreamTls {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("client tls handshake failed: {0}")]
    ClientTls(std::io::Error),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("ask channel error: {0}")]
    Ask(#[from] crate::ask::AskError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
