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

pub mod ask;
pub mod ca;
pub mod credentials;
pub mod filter;
pub mod log;
pub mod redaction;

use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "proxy.yaml";
pub const CONFIG_PATH_ENV: &str = "DEVSANDBOX_PROXY_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen: Option<String>,
    pub sandbox_root: Option<String>,
    #[serde(default)]
    pub ca: ca::CaConfig,
    #[serde(default)]
    pub log: log::LogConfig,
    #[serde(default)]
    pub remote_log: log::RemoteLogConfig,
    #[serde(default)]
    pub filter: filter::FilterConfig,
    #[serde(default)]
    pub ask: ask::AskConfig,
    #[serde(default)]
    pub redaction: redaction::RedactionConfig,
    #[serde(default)]
    pub credentials: credentials::CredentialsConfig,
}

impl Config {
    pub fn listen_addr(&self) -> &str {
        self.listen.as_deref().unwrap_or("127.0.0.1:8080")
    }

    pub fn sandbox_root(&self) -> PathBuf {
        match &self.sandbox_root {
            Some(root) => PathBuf::from(root),
            None => PathBuf::from("./devsandbox"),
        }
    }

    pub fn ca_dir(&self) -> PathBuf {
        match self.ca.get_dir() {
            Some(dir) => PathBuf::from(dir),
            None => self.sandbox_root().join("ca"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        match self.log.get_dir() {
            Some(dir) => PathBuf::from(dir),
            None => self.sandbox_root().join("logs").join("proxy"),
        }
    }

    pub fn ask_socket_path(&self) -> PathBuf {
        match self.ask.get_socket_path() {
            Some(path) => PathBuf::from(path),
            None => self.log_dir().join(".ask").join("ask.sock"),
        }
    }

    pub fn ask_lock_path(&self) -> PathBuf {
        self.ask_socket_path()
            .parent()
            .map(|dir| dir.join("ask.lock"))
            .unwrap_or_else(|| self.log_dir().join(".ask").join("ask.lock"))
    }

    // load and parse the yaml configuration file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_yaml::from_reader(file).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config)
    }

    // resolve the config path from an explicit override, then the env var,
    // then the default path, and load it.
    pub fn from_env_and_file(path_opt: Option<PathBuf>) -> Result<Config, ConfigError> {
        let path = path_opt
            .or_else(|| env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Config::load(&path)
    }
}
