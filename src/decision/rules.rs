//! Deterministic rules the deconfliction engine applies to decision text.
//!
//! Nothing here understands language. Each rule extracts a small, comparable
//! fact from one decision (which option of an exclusive group it picks, which
//! numeric bound it places on a metric, who it says owns what) and
//! `conflicts` compares those facts pairwise.

use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

/// Options that cannot be chosen together. Each option may carry aliases
/// separated by `|`; the first alias is the canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusiveGroup {
    pub name: String,
    pub options: Vec<String>,
}

/// Two families of terms that are architecturally at odds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensionRule {
    pub name: String,
    pub left: Vec<String>,
    pub right: Vec<String>,
}

/// `[deconfliction]` section of `foreman.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeconflictionConfig {
    /// Keep the built-in groups, tensions and metrics.
    #[serde(default = "default_builtin_rules")]
    pub builtin_rules: bool,
    #[serde(default)]
    pub exclusive_groups: Vec<ExclusiveGroup>,
    #[serde(default)]
    pub tensions: Vec<TensionRule>,
    #[serde(default)]
    pub resource_metrics: Vec<String>,
}

impl Default for DeconflictionConfig {
    fn default() -> Self {
        Self {
            builtin_rules: default_builtin_rules(),
            exclusive_groups: Vec::new(),
            tensions: Vec::new(),
            resource_metrics: Vec::new(),
        }
    }
}

fn default_builtin_rules() -> bool {
    true
}

fn group(name: &str, options: &[&str]) -> ExclusiveGroup {
    ExclusiveGroup {
        name: name.to_string(),
        options: options.iter().map(|s| s.to_string()).collect(),
    }
}

fn tension(name: &str, left: &[&str], right: &[&str]) -> TensionRule {
    TensionRule {
        name: name.to_string(),
        left: left.iter().map(|s| s.to_string()).collect(),
        right: right.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn builtin_groups() -> Vec<ExclusiveGroup> {
    vec![
        group(
            "client-token-storage",
            &[
                "localstorage|local storage",
                "sessionstorage|session storage",
                "cookie|httponly cookie",
                "indexeddb",
            ],
        ),
        group(
            "server-session-store",
            &[
                "redis",
                "memcached",
                "postgres|postgresql",
                "mysql",
                "sqlite",
                "in-memory|in memory",
            ],
        ),
        group(
            "api-transport",
            &["graphql", "grpc", "rest api|restful|rest endpoint", "json-rpc"],
        ),
        group(
            "consistency-model",
            &[
                "strong consistency|strongly consistent",
                "eventual consistency|eventually consistent",
            ],
        ),
    ]
}

pub fn builtin_tensions() -> Vec<TensionRule> {
    vec![
        tension(
            "session-statefulness",
            &["stateless"],
            &["server-side session", "sticky session", "stateful"],
        ),
        tension(
            "call-model",
            &["synchronous", "blocking call"],
            &["asynchronous", "event-driven", "message queue"],
        ),
        tension("deployment-shape", &["monolith"], &["microservice"]),
        tension(
            "rendering",
            &["client-side rendering", "csr"],
            &["server-side rendering", "ssr"],
        ),
    ]
}

pub fn builtin_metrics() -> Vec<String> {
    [
        "latency",
        "response time",
        "timeout",
        "memory",
        "bundle size",
        "payload size",
        "ttl",
        "budget",
        "rate limit",
        "retries",
        "page weight",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ── Extracted facts ───────────────────────────────────────────────────

/// Options of one exclusive group a decision mentions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mentions {
    pub chosen: BTreeSet<String>,
    pub rejected: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnitClass {
    Time,
    Size,
    Percent,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Max,
    Min,
    Exact,
}

/// A numeric constraint normalized to milliseconds, bytes, percent or a
/// plain count.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub metric: String,
    pub bound: Bound,
    pub value: f64,
    pub unit: UnitClass,
}

impl Constraint {
    /// Whether both constraints can hold at once.
    pub fn compatible_with(&self, other: &Constraint) -> bool {
        if self.metric != other.metric || self.unit != other.unit {
            return true;
        }
        let eps = 1e-9;
        match (self.bound, other.bound) {
            (Bound::Max, Bound::Min) => other.value <= self.value + eps,
            (Bound::Min, Bound::Max) => self.value <= other.value + eps,
            (Bound::Exact, Bound::Exact) => (self.value - other.value).abs() < eps,
            (Bound::Exact, Bound::Max) => self.value <= other.value + eps,
            (Bound::Max, Bound::Exact) => other.value <= self.value + eps,
            (Bound::Exact, Bound::Min) => self.value + eps >= other.value,
            (Bound::Min, Bound::Exact) => other.value + eps >= self.value,
            (Bound::Max, Bound::Max) | (Bound::Min, Bound::Min) => true,
        }
    }

    pub fn describe(&self) -> String {
        let op = match self.bound {
            Bound::Max => "<=",
            Bound::Min => ">=",
            Bound::Exact => "=",
        };
        let unit = match self.unit {
            UnitClass::Time => "ms",
            UnitClass::Size => "B",
            UnitClass::Percent => "%",
            UnitClass::Count => "",
        };
        format!("{} {} {}{}", self.metric, op, self.value, unit)
    }
}

/// Everything the rules extracted from one decision's text.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    /// Group name -> mentions, only for groups with at least one mention.
    pub choices: Vec<(String, Mentions)>,
    pub tensions: Vec<(String, Side)>,
    pub constraints: Vec<Constraint>,
    /// (owner, mechanism)
    pub ownership: Vec<(String, String)>,
    pub requires: Vec<String>,
    pub lacks: Vec<String>,
    pub provides: Vec<String>,
}

// ── Compiled rule set ─────────────────────────────────────────────────

struct Term {
    canonical: String,
    pattern: Regex,
}

struct CompiledGroup {
    name: String,
    options: Vec<Term>,
}

struct CompiledTension {
    name: String,
    left: Vec<Term>,
    right: Vec<Term>,
}

struct CompiledMetric {
    name: String,
    after: Regex,
    before: Regex,
}

pub struct RuleSet {
    groups: Vec<CompiledGroup>,
    tensions: Vec<CompiledTension>,
    metrics: Vec<CompiledMetric>,
    ownership: Regex,
    requires: Regex,
    lacks: Regex,
    provides: Regex,
}

const NEGATORS: &[&str] = &[
    "not", "no", "never", "avoid", "without", "instead", "don't", "dont", "nor", "rather",
];

const MAX_OPS: &str = r"under|below|less\s+than|at\s+most|no\s+more\s+than|up\s+to|within|maximum\s+of|max|<=|<";
const MIN_OPS: &str = r"over|above|more\s+than|at\s+least|minimum\s+of|min|>=|>";
const EXACT_OPS: &str = r"exactly|equal\s+to|of|is|=";
const UNITS: &str = r"ms|milliseconds?|secs?|seconds?|s|minutes?|mins?|kb|mb|gb|bytes?|b|%";
const PHRASE: &str = r"[a-z0-9][\w\s/-]*?";

fn build(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

fn alias_pattern(aliases: &[&str]) -> String {
    aliases
        .iter()
        .map(|alias| {
            alias
                .split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn term(spec: &str) -> Result<Term, regex::Error> {
    let aliases: Vec<&str> = spec
        .split('|')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .collect();
    let canonical = aliases.first().copied().unwrap_or(spec).to_lowercase();
    let pattern = build(&format!(r"\b(?:{})(?:s|es)?\b", alias_pattern(&aliases)))?;
    Ok(Term { canonical, pattern })
}

fn metric(name: &str) -> Result<CompiledMetric, regex::Error> {
    let m = alias_pattern(&[name]);
    let ops = format!("{MAX_OPS}|{MIN_OPS}|{EXACT_OPS}");
    let value = r"(?P<val>\d+(?:\.\d+)?)";
    let unit = format!(r"(?P<unit>{UNITS})?\b");
    Ok(CompiledMetric {
        name: name.to_lowercase(),
        after: build(&format!(
            r"\b(?:{m})s?\b[^.;\n]{{0,40}}?(?:^|\s)(?P<op>{ops})\s*{value}\s*{unit}"
        ))?,
        before: build(&format!(
            r"(?:^|\s)(?P<op>{ops})\s*{value}\s*{unit}\s+(?:of\s+)?(?:{m})s?\b"
        ))?,
    })
}

fn normalize_phrase(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut words: Vec<&str> = lowered.split_whitespace().collect();
    while matches!(words.first(), Some(&"the") | Some(&"a") | Some(&"an") | Some(&"any")) {
        words.remove(0);
    }
    words.join(" ")
}

fn is_negated(text: &str, start: usize) -> bool {
    text[..start].split_whitespace().rev().take(3).any(|word| {
        let word = word
            .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
            .to_lowercase();
        NEGATORS.contains(&word.as_str())
    })
}

fn classify_op(op: &str) -> Bound {
    let op = op.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    match op.as_str() {
        "under" | "below" | "less than" | "at most" | "no more than" | "up to" | "within"
        | "maximum of" | "max" | "<=" | "<" => Bound::Max,
        "over" | "above" | "more than" | "at least" | "minimum of" | "min" | ">=" | ">" => Bound::Min,
        _ => Bound::Exact,
    }
}

fn normalize_value(value: f64, unit: Option<&str>) -> (f64, UnitClass) {
    match unit.map(str::to_lowercase).as_deref() {
        Some("ms" | "millisecond" | "milliseconds") => (value, UnitClass::Time),
        Some("s" | "sec" | "secs" | "second" | "seconds") => (value * 1_000.0, UnitClass::Time),
        Some("min" | "mins" | "minute" | "minutes") => (value * 60_000.0, UnitClass::Time),
        Some("b" | "byte" | "bytes") => (value, UnitClass::Size),
        Some("kb") => (value * 1024.0, UnitClass::Size),
        Some("mb") => (value * 1024.0 * 1024.0, UnitClass::Size),
        Some("gb") => (value * 1024.0 * 1024.0 * 1024.0, UnitClass::Size),
        Some("%") => (value, UnitClass::Percent),
        _ => (value, UnitClass::Count),
    }
}

impl RuleSet {
    pub fn builtin() -> Result<Self, regex::Error> {
        Self::from_config(&DeconflictionConfig::default())
    }

    pub fn from_config(config: &DeconflictionConfig) -> Result<Self, regex::Error> {
        let mut groups = if config.builtin_rules { builtin_groups() } else { Vec::new() };
        groups.extend(config.exclusive_groups.iter().cloned());
        let mut tensions = if config.builtin_rules { builtin_tensions() } else { Vec::new() };
        tensions.extend(config.tensions.iter().cloned());
        let mut metrics = if config.builtin_rules { builtin_metrics() } else { Vec::new() };
        metrics.extend(config.resource_metrics.iter().cloned());
        metrics.sort();
        metrics.dedup();

        Ok(Self {
            groups: groups
                .iter()
                .map(|g| {
                    Ok(CompiledGroup {
                        name: g.name.clone(),
                        options: g.options.iter().map(|o| term(o)).collect::<Result<_, _>>()?,
                    })
                })
                .collect::<Result<_, regex::Error>>()?,
            tensions: tensions
                .iter()
                .map(|t| {
                    Ok(CompiledTension {
                        name: t.name.clone(),
                        left: t.left.iter().map(|s| term(s)).collect::<Result<_, _>>()?,
                        right: t.right.iter().map(|s| term(s)).collect::<Result<_, _>>()?,
                    })
                })
                .collect::<Result<_, regex::Error>>()?,
            metrics: metrics.iter().map(|m| metric(m)).collect::<Result<_, _>>()?,
            ownership: build(&format!(
                r"\b(?P<owner>[a-z][\w-]*(?:\s+[a-z][\w-]*)?)\s+(?:owns|is\s+responsible\s+for|has\s+(?:sole\s+)?authority\s+over|is\s+the\s+owner\s+of)\s+(?P<what>{PHRASE})\s*(?:[.;,]|$)"
            ))?,
            requires: build(&format!(
                r"\b(?:requires|assumes|depends\s+on|relies\s+on)\s+(?P<cap>{PHRASE})\s*(?:[.;,]|$)"
            ))?,
            lacks: build(&format!(
                r"\b(?:does\s+not|doesn't|do\s+not|will\s+not|won't|cannot|can't)\s+(?:provide|support|expose|offer)\s+(?P<cap>{PHRASE})\s*(?:[.;,]|$)"
            ))?,
            provides: build(&format!(
                r"\b(?:provides|supports|exposes|offers)\s+(?P<cap>{PHRASE})\s*(?:[.;,]|$)"
            ))?,
        })
    }

    /// Extract every comparable fact from `text`.
    pub fn profile(&self, text: &str) -> Profile {
        let mut profile = Profile::default();

        for group in &self.groups {
            let mut mentions = Mentions::default();
            for option in &group.options {
                for found in option.pattern.find_iter(text) {
                    if is_negated(text, found.start()) {
                        mentions.rejected.insert(option.canonical.clone());
                    } else {
                        mentions.chosen.insert(option.canonical.clone());
                    }
                }
            }
            if !mentions.chosen.is_empty() || !mentions.rejected.is_empty() {
                profile.choices.push((group.name.clone(), mentions));
            }
        }

        for tension in &self.tensions {
            let matches = |terms: &[Term]| {
                terms.iter().any(|t| {
                    t.pattern
                        .find_iter(text)
                        .any(|found| !is_negated(text, found.start()))
                })
            };
            match (matches(&tension.left), matches(&tension.right)) {
                (true, false) => profile.tensions.push((tension.name.clone(), Side::Left)),
                (false, true) => profile.tensions.push((tension.name.clone(), Side::Right)),
                _ => {}
            }
        }

        for metric in &self.metrics {
            for pattern in [&metric.after, &metric.before] {
                for caps in pattern.captures_iter(text) {
                    let (Some(op), Some(val)) = (caps.name("op"), caps.name("val")) else {
                        continue;
                    };
                    let Ok(raw) = val.as_str().parse::<f64>() else {
                        continue;
                    };
                    let (value, unit) = normalize_value(raw, caps.name("unit").map(|u| u.as_str()));
                    let constraint = Constraint {
                        metric: metric.name.clone(),
                        bound: classify_op(op.as_str()),
                        value,
                        unit,
                    };
                    if !profile.constraints.contains(&constraint) {
                        profile.constraints.push(constraint);
                    }
                }
            }
        }

        for caps in self.ownership.captures_iter(text) {
            if let (Some(owner), Some(what)) = (caps.name("owner"), caps.name("what")) {
                let owner = normalize_phrase(owner.as_str());
                let what = normalize_phrase(what.as_str());
                if !owner.is_empty() && !what.is_empty() {
                    profile.ownership.push((owner, what));
                }
            }
        }

        let capture_all = |pattern: &Regex| -> Vec<String> {
            pattern
                .captures_iter(text)
                .filter_map(|caps| caps.name("cap").map(|c| normalize_phrase(c.as_str())))
                .filter(|cap| !cap.is_empty())
                .collect()
        };
        profile.requires = capture_all(&self.requires);
        profile.lacks = capture_all(&self.lacks);
        profile.provides = capture_all(&self.provides);

        profile
    }
}

/// Whether two capability phrases name the same thing: equal, or one
/// contains the other on word boundaries.
pub fn capability_matches(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let padded_a = format!(" {a} ");
    let padded_b = format!(" {b} ");
    padded_a.contains(&padded_b) || padded_b.contains(&padded_a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> RuleSet {
        RuleSet::builtin().unwrap()
    }

    #[test]
    fn picks_up_exclusive_options_with_aliases_and_plurals() {
        let profile = rules().profile("Keep session tokens in httpOnly cookies.");
        let (group, mentions) = &profile.choices[0];
        assert_eq!(group, "client-token-storage");
        assert!(mentions.chosen.contains("cookie"));

        let profile = rules().profile("Persist the refresh token in Local Storage");
        assert!(profile.choices[0].1.chosen.contains("localstorage"));
    }

    #[test]
    fn negated_options_are_rejections() {
        let profile = rules().profile("Use cookies, never localStorage, for tokens.");
        let mentions = &profile.choices[0].1;
        assert!(mentions.chosen.contains("cookie"));
        assert!(mentions.rejected.contains("localstorage"));
    }

    #[test]
    fn tension_side_requires_one_sided_match() {
        let profile = rules().profile("The API layer is stateless.");
        assert_eq!(profile.tensions, vec![("session-statefulness".to_string(), Side::Left)]);

        let profile = rules().profile("Calls are asynchronous through a message queue.");
        assert_eq!(profile.tensions, vec![("call-model".to_string(), Side::Right)]);
    }

    #[test]
    fn constraints_normalize_units() {
        let profile = rules().profile("p95 latency must stay under 2s.");
        assert_eq!(profile.constraints.len(), 1);
        let c = &profile.constraints[0];
        assert_eq!(c.bound, Bound::Max);
        assert_eq!(c.value, 2000.0);
        assert_eq!(c.unit, UnitClass::Time);

        let profile = rules().profile("Allow at least 512 MB memory per worker.");
        let c = &profile.constraints[0];
        assert_eq!(c.metric, "memory");
        assert_eq!(c.bound, Bound::Min);
        assert_eq!(c.unit, UnitClass::Size);
    }

    #[test]
    fn constraint_compatibility() {
        let max = Constraint { metric: "latency".into(), bound: Bound::Max, value: 200.0, unit: UnitClass::Time };
        let min = Constraint { metric: "latency".into(), bound: Bound::Min, value: 500.0, unit: UnitClass::Time };
        let exact = Constraint { metric: "latency".into(), bound: Bound::Exact, value: 100.0, unit: UnitClass::Time };
        assert!(!max.compatible_with(&min));
        assert!(!min.compatible_with(&max));
        assert!(max.compatible_with(&exact));
        assert!(!min.compatible_with(&exact));
        assert!(max.compatible_with(&max));
    }

    #[test]
    fn ownership_and_capabilities_are_extracted() {
        let profile = rules().profile("The auth service owns session invalidation.");
        assert_eq!(
            profile.ownership,
            vec![("auth service".to_string(), "session invalidation".to_string())]
        );

        let profile = rules().profile("The worker relies on a shared cache. It does not provide retries.");
        assert_eq!(profile.requires, vec!["shared cache".to_string()]);
        assert_eq!(profile.lacks, vec!["retries".to_string()]);
    }

    #[test]
    fn capability_matching_uses_word_boundaries() {
        assert!(capability_matches("shared cache", "cache"));
        assert!(!capability_matches("cachet", "cache"));
    }

    #[test]
    fn builtin_rules_can_be_disabled() {
        let config = DeconflictionConfig {
            builtin_rules: false,
            exclusive_groups: vec![group("queue", &["kafka", "rabbitmq"])],
            ..Default::default()
        };
        let rules = RuleSet::from_config(&config).unwrap();
        assert!(rules.profile("Tokens live in localStorage").choices.is_empty());
        assert_eq!(rules.profile("Events go through Kafka").choices[0].0, "queue");
    }
}
