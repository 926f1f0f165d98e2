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

use regex::Regex;

use crate::config::filter::{FilterConfig, FilterRuleConfig, PatternKind, RuleAction, RuleScope};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Allow,
    Block,
    Ask,
}

impl From<RuleAction> for FilterAction {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Allow => FilterAction::Allow,
            RuleAction::Block => FilterAction::Block,
            RuleAction::Ask => FilterAction::Ask,
        }
    }
}

enum Matcher {
    Exact(String),
    Glob(Regex),
    Regex(Regex),
}

impl Matcher {
    fn matches(&self, subject: &str) -> bool {
        match self {
            Matcher::Exact(pattern) => pattern.eq_ignore_ascii_case(subject),
            Matcher::Glob(re) | Matcher::Regex(re) => re.is_match(subject),
        }
    }
}

struct CompiledRule {
    matcher: Matcher,
    scope: RuleScope,
    action: FilterAction,
    pattern: String,
    reason: Option<String>,
}

/// Decision the engine reached for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    pub action: FilterAction,
    pub matched_rule: Option<String>,
    pub reason: String,
    pub is_default: bool,
    pub from_cache: bool,
}

/// Evaluates host/path/url filter rules against each request and caches
/// host-scoped decisions so repeated traffic to an already-judged host
/// skips re-evaluation. Rules that depend on path or full URL always
/// bypass the cache since their outcome can vary per request.
pub struct FilterEngine {
    rules: Vec<CompiledRule>,
    default_action: FilterAction,
    cache_decisions: bool,
    decision_cache: scc::HashMap<String, FilterDecision>,
}

impl FilterEngine {
    pub fn from_config(config: &FilterConfig) -> Result<FilterEngine, ConfigError> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            rules.push(compile_rule(rule)?);
        }
        Ok(FilterEngine {
            rules,
            default_action: config.default_action().into(),
            cache_decisions: config.cache_decisions(),
            decision_cache: scc::HashMap::new(),
        })
    }

    /// Evaluate the filter for a request against `host`, `path`, and the
    /// full `url`. Only host-scoped rule outcomes are cached.
    pub fn decide(&self, host: &str, path: &str, url: &str) -> FilterDecision {
        let normalized_host = normalize_host(host);

        if self.cache_decisions && !self.has_non_host_rules() {
            if let Some(cached) = self.decision_cache.read(&normalized_host, |_, v| v.clone()) {
                return FilterDecision {
                    from_cache: true,
                    reason: "cached decision".to_string(),
                    ..cached
                };
            }
        }

        let decision = self.evaluate(&normalized_host, path, url);

        if self.cache_decisions && !self.has_non_host_rules() {
            let _ = self.decision_cache.insert(normalized_host, decision.clone());
        }

        decision
    }

    /// Record a remembered decision (typically from an `ask` response with
    /// `remember = true`) under the request's normalized host, regardless
    /// of whether caching would otherwise apply to this rule set.
    pub fn cache_decision(&self, host: &str, action: FilterAction) {
        let normalized_host = normalize_host(host);
        let decision = FilterDecision {
            action,
            matched_rule: None,
            reason: "remembered user decision".to_string(),
            is_default: false,
            from_cache: true,
        };
        let _ = self.decision_cache.insert(normalized_host, decision);
    }

    pub fn clear_cache(&self) {
        self.decision_cache.clear();
    }

    fn has_non_host_rules(&self) -> bool {
        self.rules.iter().any(|r| r.scope != RuleScope::Host)
    }

    fn evaluate(&self, host: &str, path: &str, url: &str) -> FilterDecision {
        for rule in &self.rules {
            let subject = match rule.scope {
                RuleScope::Host => host,
                RuleScope::Path => path,
                RuleScope::Url => url,
            };
            if rule.matcher.matches(subject) {
                let reason = rule
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("matched rule: {}", rule.pattern));
                return FilterDecision {
                    action: rule.action,
                    matched_rule: Some(rule.pattern.clone()),
                    reason,
                    is_default: false,
                    from_cache: false,
                };
            }
        }
        FilterDecision {
            action: self.default_action,
            matched_rule: None,
            reason: "default action".to_string(),
            is_default: true,
            from_cache: false,
        }
    }
}

/// Strip the port and, for bracketed IPv6 literals, the brackets from a
/// host string, then lowercase it. Idempotent: normalizing an already
/// normalized host returns the same string.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_end_matches('.');

    if let Some(rest) = host.strip_prefix('[') {
        // bracketed ipv6 literal, optionally followed by ":<port>"
        if let Some(end) = rest.find(']') {
            return rest[..end].to_ascii_lowercase();
        }
        return rest.to_ascii_lowercase();
    }

    // an ipv6 literal without brackets (e.g. from a normalized host being
    // normalized again) has multiple colons and no port to strip.
    if host.matches(':').count() > 1 {
        return host.to_ascii_lowercase();
    }

    match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            h.to_ascii_lowercase()
        }
        _ => host.to_ascii_lowercase(),
    }
}

fn compile_rule(rule: &FilterRuleConfig) -> Result<CompiledRule, ConfigError> {
    if rule.pattern.is_empty() {
        return Err(ConfigError::InvalidFilterRule {
            pattern: rule.pattern.clone(),
            reason: "pattern must not be empty".to_string(),
        });
    }

    let kind = rule.kind.unwrap_or_else(|| detect_pattern_kind(&rule.pattern));
    let separator = match rule.scope {
        RuleScope::Host => '.',
        RuleScope::Path | RuleScope::Url => '/',
    };
    let matcher = match kind {
        PatternKind::Exact => Matcher::Exact(rule.pattern.to_ascii_lowercase()),
        PatternKind::Glob => Matcher::Glob(compile_glob(&rule.pattern, separator)?),
        PatternKind::Regex => Matcher::Regex(Regex::new(&rule.pattern).map_err(|source| {
            ConfigError::InvalidRegex {
                pattern: rule.pattern.clone(),
                source,
            }
        })?),
    };
    Ok(CompiledRule {
        matcher,
        scope: rule.scope,
        action: rule.action.into(),
        pattern: rule.pattern.clone(),
        reason: rule.reason.clone(),
    })
}

/// A pattern is treated as a glob if it has `*`/`?` but none of the
/// characters that only make sense as a regex; anything with regex
/// metacharacters beyond that is treated as a full regex.
fn detect_pattern_kind(pattern: &str) -> PatternKind {
    const REGEX_ONLY: &[char] = &['^', '$', '(', ')', '[', ']', '|', '\\'];
    if pattern.chars().any(|c| REGEX_ONLY.contains(&c)) {
        PatternKind::Regex
    } else if pattern.contains('*') || pattern.contains('?') {
        PatternKind::Glob
    } else {
        PatternKind::Exact
    }
}

/// Compile a glob where `*` matches a run of characters other than
/// `separator`, `**` matches any run including `separator`, and `?`
/// matches exactly one character.
fn compile_glob(pattern: &str, separator: char) -> Result<Regex, ConfigError> {
    let mut out = String::from("(?i)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str(&format!("[^{}]*", regex_escape_char(separator)));
                }
            }
            '?' => out.push('.'),
            _ if is_regex_meta(c) => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|source| ConfigError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

fn regex_escape_char(c: char) -> String {
    if is_regex_meta(c) {
        format!("\\{c}")
    } else {
        c.to_string()
    }
}

fn is_regex_meta(c: char) -> bool {
    matches!(
        c,
        '.' | '^' | '$' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '+' | '\\'
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::filter::FilterConfig;

    fn engine(yaml: &str) -> FilterEngine {
        let config: FilterConfig = serde_yaml::from_str(yaml).unwrap();
        FilterEngine::from_config(&config).unwrap()
    }

    #[test]
    fn default_action_applies_when_no_rule_matches() {
        let e = engine("default_action: block\nrules: []\n");
        let decision = e.decide("example.com", "/", "https://example.com/");
        assert_eq!(decision.action, FilterAction::Block);
        assert!(decision.matched_rule.is_none());
        assert!(decision.is_default);
    }

    #[test]
    fn single_star_glob_does_not_cross_host_labels() {
        let e = engine(
            "default_action: block\nrules:\n  - pattern: \"*.github.com\"\n    scope: host\n    action: allow\n",
        );
        assert_eq!(
            e.decide("api.github.com", "/", "https://api.github.com/").action,
            FilterAction::Allow
        );
        assert_eq!(
            e.decide("raw.githubusercontent.github.com", "/", "x").action,
            FilterAction::Block
        );
    }

    #[test]
    fn double_star_glob_crosses_host_labels() {
        let e = engine(
            "default_action: block\nrules:\n  - pattern: \"**.github.com\"\n    scope: host\n    action: allow\n",
        );
        assert_eq!(
            e.decide("api.github.com", "/", "x").action,
            FilterAction::Allow
        );
        assert_eq!(
            e.decide("raw.githubusercontent.github.com", "/", "x").action,
            FilterAction::Allow
        );
        assert_eq!(e.decide("github.com", "/", "x").action, FilterAction::Block);
    }

    #[test]
    fn exact_rule_does_not_match_subdomain() {
        let e = engine(
            "default_action: block\nrules:\n  - pattern: \"github.com\"\n    scope: host\n    action: allow\n",
        );
        let decision = e.decide("api.github.com", "/", "https://api.github.com/");
        assert_eq!(decision.action, FilterAction::Block);
    }

    #[test]
    fn regex_auto_detection_matches_anchored_pattern() {
        let e = engine(
            "default_action: block\nrules:\n  - pattern: \"^api\\\\.example\\\\.com$\"\n    scope: host\n    action: allow\n",
        );
        assert_eq!(e.decide("api.example.com", "/", "x").action, FilterAction::Allow);
        assert_eq!(e.decide("www.api.example.com", "/", "x").action, FilterAction::Block);
    }

    #[test]
    fn host_decision_is_cached() {
        let e = engine(
            "default_action: ask\nrules:\n  - pattern: \"example.com\"\n    scope: host\n    action: allow\n",
        );
        let first = e.decide("example.com", "/a", "https://example.com/a");
        let second = e.decide("example.com", "/b", "https://example.com/b");
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.action, second.action);
    }

    #[test]
    fn cache_decision_is_keyed_by_normalized_host() {
        let e = engine("default_action: ask\nrules: []\n");
        e.cache_decision("Example.com:8443", FilterAction::Allow);
        let with_port = e.decide("example.com:8443", "/", "x");
        let without_port = e.decide("EXAMPLE.COM", "/", "x");
        assert_eq!(with_port.action, FilterAction::Allow);
        assert_eq!(without_port.action, FilterAction::Allow);
    }

    #[test]
    fn path_scoped_rules_bypass_cache() {
        let e = engine(
            "default_action: allow\nrules:\n  - pattern: \"/secret*\"\n    scope: path\n    action: block\n",
        );
        let blocked = e.decide("example.com", "/secret", "https://example.com/secret");
        let allowed = e.decide("example.com", "/public", "https://example.com/public");
        assert_eq!(blocked.action, FilterAction::Block);
        assert_eq!(allowed.action, FilterAction::Allow);
        assert!(!blocked.from_cache);
        assert!(!allowed.from_cache);
    }

    #[test]
    fn normalize_host_is_idempotent() {
        for h in ["Example.COM:443", "[::1]:8080", "[::1]", "example.com.", "example.com"] {
            let once = normalize_host(h);
            let twice = normalize_host(&once);
            assert_eq!(once, twice, "not idempotent for {h:?}");
        }
    }

    #[test]
    fn normalize_host_strips_port_and_brackets() {
        assert_eq!(normalize_host("Example.com:8080"), "example.com");
        assert_eq!(normalize_host("[::1]:8080"), "::1");
        assert_eq!(normalize_host("[::1]"), "::1");
    }
}
