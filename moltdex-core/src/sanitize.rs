//! Credential redaction for scraped text
//!
//! Every text field is passed through an ordered list of redaction rules
//! before it reaches the index builder. Rules are applied left to right,
//! each replacing all of its matches with a fixed marker.
//!
//! Built-in rules cover:
//! - PEM private key blocks
//! - Provider API keys (Anthropic, OpenAI, Moltbook)
//! - GitHub and Slack tokens
//! - AWS access key ids
//! - Bearer tokens
//! - `key = value` style secrets (api_key, token, password, ...)
//!
//! Markers never match any rule, so sanitizing twice is the same as once.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

use crate::{FetchBatch, RawAgent, RawPost, RawRecord};

/// Errors from building a sanitizer
#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("Invalid pattern for redaction rule '{name}': {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Data-driven rule definition, as read from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub pattern: String,
    /// Replacement text; `$name` / `${name}` refer to capture groups
    #[serde(default = "default_replacement")]
    pub replacement: String,
}

fn default_replacement() -> String {
    "[REDACTED]".to_string()
}

/// A compiled redaction rule
#[derive(Debug, Clone)]
pub struct RedactionRule {
    name: String,
    pattern: Regex,
    replacement: String,
}

impl RedactionRule {
    pub fn new(name: &str, pattern: &str, replacement: &str) -> Result<Self, SanitizeError> {
        let pattern = Regex::new(pattern).map_err(|source| SanitizeError::InvalidPattern {
            name: name.to_string(),
            source,
        })?;
        Ok(Self {
            name: name.to_string(),
            pattern,
            replacement: replacement.to_string(),
        })
    }

    pub fn from_spec(spec: &RuleSpec) -> Result<Self, SanitizeError> {
        Self::new(&spec.name, &spec.pattern, &spec.replacement)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }

    /// Replace every match; borrows when nothing matched
    pub fn apply<'t>(&self, text: &'t str) -> Cow<'t, str> {
        self.pattern.replace_all(text, self.replacement.as_str())
    }
}

/// Number of matches a single rule redacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionInfo {
    pub rule: String,
    pub count: usize,
}

/// Built-in rules: (name, pattern, replacement). Order matters: specific
/// provider prefixes run before the generic ones that would also match.
const BUILTIN_RULES: &[(&str, &str, &str)] = &[
    (
        "private_key",
        r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?(?:-----END [A-Z ]*PRIVATE KEY-----|\z)",
        "[REDACTED_PRIVATE_KEY]",
    ),
    ("anthropic_key", r"sk-ant-[A-Za-z0-9_\-]{20,}", "[REDACTED_API_KEY]"),
    ("openai_project_key", r"sk-proj-[A-Za-z0-9_\-]{20,}", "[REDACTED_API_KEY]"),
    ("openai_key", r"sk-[A-Za-z0-9]{20,}", "[REDACTED_API_KEY]"),
    ("moltbook_key", r"moltbook_sk_[A-Za-z0-9_\-]+", "[REDACTED_API_KEY]"),
    ("github_token", r"gh[pousr]_[A-Za-z0-9]{36,}", "[REDACTED_TOKEN]"),
    ("github_pat", r"github_pat_[A-Za-z0-9_]{22,}", "[REDACTED_TOKEN]"),
    ("slack_token", r"xox[abprs]-[A-Za-z0-9\-]+", "[REDACTED_TOKEN]"),
    ("aws_access_key", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", "[REDACTED_AWS_KEY]"),
    (
        "bearer_token",
        r"(?i)\bbearer\s+[A-Za-z0-9\-._~+/]{16,}=*",
        "Bearer [REDACTED_TOKEN]",
    ),
    // Values shorter than 8 chars are left alone so "Bearer" from the rule
    // above is never taken for a value.
    (
        "key_value_secret",
        r#"(?i)(?P<key>api[_\-]?key|access[_\-]?key|secret[_\-]?key|client[_\-]?secret|private[_\-]?key|auth[_\-]?token|secret|token|passwd|password)(?P<sep>["']?\s*[:=]\s*["']?)[A-Za-z0-9_\-./+=]{8,}"#,
        "${key}${sep}[REDACTED_SECRET]",
    ),
];

static BUILTIN: LazyLock<Vec<RedactionRule>> = LazyLock::new(|| {
    BUILTIN_RULES
        .iter()
        .map(|(name, pattern, replacement)| RedactionRule::new(name, pattern, replacement).unwrap())
        .collect()
});

static DEFAULT_SANITIZER: LazyLock<Sanitizer> = LazyLock::new(Sanitizer::default);

/// Sanitize text with the built-in rule set
pub fn sanitize(text: &str) -> String {
    DEFAULT_SANITIZER.sanitize(text)
}

/// Ordered list of redaction rules
#[derive(Debug, Clone)]
pub struct Sanitizer {
    rules: Vec<RedactionRule>,
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self {
            rules: BUILTIN.clone(),
        }
    }
}

impl Sanitizer {
    /// A sanitizer with exactly the given rules
    pub fn new(rules: Vec<RedactionRule>) -> Self {
        Self { rules }
    }

    /// Built-in rules followed by `extra`
    pub fn with_extra_rules(extra: &[RuleSpec]) -> Result<Self, SanitizeError> {
        let mut sanitizer = Self::default();
        for spec in extra {
            sanitizer.push_rule(RedactionRule::from_spec(spec)?);
        }
        Ok(sanitizer)
    }

    pub fn push_rule(&mut self, rule: RedactionRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[RedactionRule] {
        &self.rules
    }

    pub fn sanitize(&self, text: &str) -> String {
        self.sanitize_with_report(text).0
    }

    /// Sanitize and report which rules fired and how often
    pub fn sanitize_with_report(&self, text: &str) -> (String, Vec<RedactionInfo>) {
        let mut out = text.to_string();
        let mut report = Vec::new();

        for rule in &self.rules {
            let count = rule.pattern.find_iter(&out).count();
            if count == 0 {
                continue;
            }
            let next = match rule.apply(&out) {
                Cow::Borrowed(_) => None,
                Cow::Owned(s) => Some(s),
            };
            if let Some(s) = next {
                out = s;
            }
            report.push(RedactionInfo {
                rule: rule.name.clone(),
                count,
            });
        }

        (out, report)
    }

    fn sanitize_field(&self, text: String, redacted: &mut usize) -> String {
        let (out, report) = self.sanitize_with_report(&text);
        *redacted += report.iter().map(|r| r.count).sum::<usize>();
        out
    }

    fn sanitize_opt(&self, text: Option<String>, redacted: &mut usize) -> Option<String> {
        text.map(|t| self.sanitize_field(t, redacted))
    }

    /// Sanitize every text field of a record.
    ///
    /// Returns the record and the number of redactions made.
    pub fn sanitize_record(&self, record: RawRecord) -> (SanitizedRecord, usize) {
        let mut redacted = 0;
        let record = match record {
            RawRecord::Post(post) => RawRecord::Post(RawPost {
                title: self.sanitize_opt(post.title, &mut redacted),
                body: self.sanitize_field(post.body, &mut redacted),
                submolt: self.sanitize_opt(post.submolt, &mut redacted),
                ..post
            }),
            RawRecord::Agent(agent) => RawRecord::Agent(RawAgent {
                name: self.sanitize_field(agent.name, &mut redacted),
                bio: self.sanitize_opt(agent.bio, &mut redacted),
                ..agent
            }),
        };
        (SanitizedRecord(record), redacted)
    }

    /// Sanitize a whole fetch batch
    pub fn sanitize_batch(&self, batch: FetchBatch) -> FetchBatch<SanitizedRecord> {
        let mut total = 0;
        let records = batch
            .records
            .into_iter()
            .map(|record| {
                let (clean, redacted) = self.sanitize_record(record);
                if redacted > 0 {
                    debug!(id = clean.record().id(), redacted, "Redacted credential-shaped text");
                }
                total += redacted;
                clean
            })
            .collect::<Vec<_>>();

        if total > 0 {
            debug!(total, records = records.len(), "Sanitized fetch batch");
        }

        FetchBatch {
            records,
            next_cursor: batch.next_cursor,
            fetched_at: batch.fetched_at,
        }
    }
}

/// A record whose text fields have passed through a [`Sanitizer`].
///
/// Only the sanitizer can construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedRecord(RawRecord);

impl SanitizedRecord {
    pub fn record(&self) -> &RawRecord {
        &self.0
    }

    pub fn into_inner(self) -> RawRecord {
        self.0
    }
}
