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

//! The intercepting HTTPS proxy subsystem of a developer sandbox: a local
//! certificate authority and TLS termination engine, a filter state
//! machine with an interactive ask channel, a redaction engine, scoped
//! credential injection, and a rotating request log with optional remote
//! forwarding.

pub mod ask;
pub mod ca;
pub mod config;
pub mod creds;
pub mod error;
pub mod filter;
pub mod lock;
pub mod logging;
pub mod proxy;
pub mod redact;

pub use config::Config;
pub use error::{ConfigError, ProxyError};
pub use proxy::ProxyServer;
