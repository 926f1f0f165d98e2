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

use std::env;

use http::{HeaderMap, HeaderValue};

use crate::config::credentials::CredentialsConfig;
use crate::error::ConfigError;
use crate::filter::normalize_host;
use crate::redact::RedactionEngine;

/// Implemented per upstream service that needs a credential injected into
/// its requests. Injectors never see a request whose host they don't own.
pub trait CredentialInjector: Send + Sync {
    fn name(&self) -> &str;
    fn host_matches(&self, host: &str) -> bool;
    /// Insert the credential into `headers`. Returns `true` if a header
    /// was inserted, `false` if a caller-provided `Authorization` was
    /// already present and left untouched.
    fn inject(&self, headers: &mut HeaderMap) -> bool;
    /// The secret material this injector attaches, exposed only so the
    /// redaction engine can be cross-checked against it at startup (a
    /// credential that a redaction rule would itself match is a fatal
    /// misconfiguration, since every credentialed request would then look
    /// like a secret leak).
    fn token_value(&self) -> &str;
}

/// Injects `Authorization: Bearer <token>` from an environment variable,
/// scoped to a single host suffix (e.g. `api.github.com`).
pub struct BearerEnvInjector {
    name: String,
    host_suffix: String,
    token: String,
}

impl BearerEnvInjector {
    pub fn new(name: &str, host_suffix: &str, env_var: &str) -> Option<BearerEnvInjector> {
        let token = env::var(env_var).ok()?;
        Some(BearerEnvInjector {
            name: name.to_string(),
            host_suffix: normalize_host(host_suffix),
            token,
        })
    }

    /// Resolve the GitHub injector's token from an explicit env var name
    /// if given, falling back to `GITHUB_TOKEN` then `GH_TOKEN`.
    pub fn github(env_var: Option<&str>) -> Option<BearerEnvInjector> {
        if let Some(name) = env_var {
            if let Some(injector) = BearerEnvInjector::new("github", "api.github.com", name) {
                return Some(injector);
            }
        }
        BearerEnvInjector::new("github", "api.github.com", "GITHUB_TOKEN")
            .or_else(|| BearerEnvInjector::new("github", "api.github.com", "GH_TOKEN"))
    }
}

impl CredentialInjector for BearerEnvInjector {
    fn name(&self) -> &str {
        &self.name
    }

    fn host_matches(&self, host: &str) -> bool {
        normalize_host(host) == self.host_suffix
    }

    fn inject(&self, headers: &mut HeaderMap) -> bool {
        if headers.contains_key(http::header::AUTHORIZATION) {
            return false;
        }
        let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.token)) else {
            return false;
        };
        headers.insert(http::header::AUTHORIZATION, value);
        true
    }

    fn token_value(&self) -> &str {
        &self.token
    }
}

/// Looks up the first injector whose scope matches the request's host.
pub struct CredentialRegistry {
    injectors: Vec<Box<dyn CredentialInjector>>,
}

impl CredentialRegistry {
    pub fn from_config(config: &CredentialsConfig) -> Result<CredentialRegistry, ConfigError> {
        let mut injectors: Vec<Box<dyn CredentialInjector>> = Vec::new();

        if let Some(entry) = config.injectors.get("github") {
            if entry.is_enabled() {
                if let Some(injector) = BearerEnvInjector::github(entry.get_env().map(|s| s.as_str())) {
                    injectors.push(Box::new(injector));
                }
            }
        }

        for (key, entry) in &config.injectors {
            if key == "github" || !entry.is_enabled() {
                continue;
            }
            let (Some(env_var), Some(host)) = (entry.get_env(), entry.get_host()) else {
                continue;
            };
            if let Some(injector) = BearerEnvInjector::new(key, host, env_var) {
                injectors.push(Box::new(injector));
            }
        }

        Ok(CredentialRegistry { injectors })
    }

    pub fn inject_for(&self, host: &str, headers: &mut HeaderMap) -> Option<&str> {
        for injector in &self.injectors {
            if injector.host_matches(host) && injector.inject(headers) {
                return Some(injector.name());
            }
        }
        None
    }

    /// Fail closed if any enabled injector's token would itself be caught
    /// by a redaction rule: every request it credentials would otherwise
    /// be flagged (and, if the rule's action is `block`, rejected) as
    /// leaking a secret that the proxy itself just injected.
    pub fn validate_against_redaction(&self, redaction: &RedactionEngine) -> Result<(), ConfigError> {
        for injector in &self.injectors {
            if let Some(rule) = redaction.matches_value(injector.token_value()) {
                return Err(ConfigError::CredentialRedactionConflict {
                    injector: injector.name().to_string(),
                    rule: rule.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_injector_matches_only_the_exact_normalized_host() {
        std::env::set_var("DEVSANDBOX_TEST_GH_TOKEN", "tok-123");
        let injector = BearerEnvInjector::new("github", "api.github.com", "DEVSANDBOX_TEST_GH_TOKEN").unwrap();
        assert!(injector.host_matches("api.github.com"));
        assert!(injector.host_matches("API.GITHUB.COM:443"));
        assert!(!injector.host_matches("uploads.api.github.com"));
        assert!(!injector.host_matches("example.com"));
    }

    #[test]
    fn github_env_var_falls_back_to_gh_token() {
        std::env::remove_var("GITHUB_TOKEN");
        std::env::set_var("GH_TOKEN", "fallback-tok");
        let injector = BearerEnvInjector::github(None).unwrap();
        assert_eq!(injector.token_value(), "fallback-tok");
        std::env::remove_var("GH_TOKEN");
    }

    #[test]
    fn validate_against_redaction_rejects_colliding_token() {
        std::env::set_var("DEVSANDBOX_TEST_GH_TOKEN3", "collide-me");
        let injector = BearerEnvInjector::new("github", "api.github.com", "DEVSANDBOX_TEST_GH_TOKEN3").unwrap();
        let registry = CredentialRegistry {
            injectors: vec![Box::new(injector)],
        };
        let redaction_config: crate::config::redaction::RedactionConfig =
            serde_yaml::from_str("rules:\n  - name: leak\n    action: block\n    value: \"collide-me\"\n").unwrap();
        let redaction = RedactionEngine::from_config(&redaction_config).unwrap();
        assert!(registry.validate_against_redaction(&redaction).is_err());
    }

    #[test]
    fn injector_does_not_overwrite_existing_authorization() {
        std::env::set_var("DEVSANDBOX_TEST_GH_TOKEN2", "tok-456");
        let injector = BearerEnvInjector::new("github", "api.github.com", "DEVSANDBOX_TEST_GH_TOKEN2").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, HeaderValue::from_static("Bearer user-supplied"));
        let injected = injector.inject(&mut headers);
        assert!(!injected);
        assert_eq!(headers.get(http::header::AUTHORIZATION).unwrap(), "Bearer user-supplied");
    }
}
