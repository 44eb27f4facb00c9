//! Secret detection and redaction.
//!
//! Two sources of secrets are removed from anything that leaves the
//! orchestrator (error messages, stacks, captured logs): literal values of
//! secret-looking environment variables, and tokens matching well-known
//! provider prefixes.

use std::sync::LazyLock;

use regex::Regex;

/// Replacement text for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Prefixes of tokens issued by common providers.
pub const LIKELY_SECRET_PREFIXES: &[&str] = &[
    "aws_",
    "ghp_",
    "gho_",
    "ghu_",
    "ghs_",
    "ghr_",
    "github_pat_",
    "glpat-",
    "sk_",
    "pk_",
    "xoxb-",
    "xoxp-",
    "nf_",
];

/// Environment variable name fragments that mark the value as secret.
const SECRET_ENV_MARKERS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "KEY", "CREDENTIAL"];

/// Shorter values are too likely to appear by accident.
const MIN_SECRET_LEN: usize = 6;

static LIKELY_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    let prefixes: Vec<String> = LIKELY_SECRET_PREFIXES
        .iter()
        .map(|p| regex::escape(p))
        .collect();
    let pattern = format!(
        r#"(?P<pre>=\s*["']?|["'])(?P<secret>(?P<prefix>{})[A-Za-z0-9-]{{12,}})(?P<post>["'\s]|$)"#,
        prefixes.join("|")
    );
    Regex::new(&pattern).unwrap()
});

/// A likely secret found in a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretMatch {
    /// The provider prefix that matched.
    pub prefix: String,
    /// Byte range of the secret value.
    pub start: usize,
    pub end: usize,
}

/// Find tokens that look like provider secrets.
///
/// Values listed in `omit` are known to be safe and are skipped.
pub fn find_likely_secrets(text: &str, omit: &[&str]) -> Vec<SecretMatch> {
    LIKELY_SECRET
        .captures_iter(text)
        .filter_map(|caps| {
            let secret = caps.name("secret")?;
            if omit.contains(&secret.as_str()) {
                return None;
            }
            Some(SecretMatch {
                prefix: caps.name("prefix")?.as_str().to_string(),
                start: secret.start(),
                end: secret.end(),
            })
        })
        .collect()
}

/// Whether an environment variable name suggests a secret value.
pub fn is_secret_env_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SECRET_ENV_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Redacts known secret values and likely secrets.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    values: Vec<String>,
}

impl Redactor {
    /// Create a redactor with no known values.
    pub fn new() -> Self {
        Redactor::default()
    }

    /// Collect the values of secret-looking variables.
    pub fn from_env<'a, I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut redactor = Redactor::new();
        for (name, value) in vars {
            if is_secret_env_name(name) {
                redactor.add_value(value);
            }
        }
        redactor
    }

    /// Register a literal secret value.
    pub fn add_value(&mut self, value: impl Into<String>) {
        let value = value.into();
        if value.len() >= MIN_SECRET_LEN && !self.values.contains(&value) {
            self.values.push(value);
            // Longest first so a value containing another is replaced whole.
            self.values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        }
    }

    /// Redact a text.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), REDACTED);
            }
        }
        LIKELY_SECRET
            .replace_all(&out, format!("${{pre}}{}${{post}}", REDACTED).as_str())
            .into_owned()
    }

    /// Redact an optional text.
    pub fn redact_opt(&self, text: Option<&str>) -> Option<String> {
        text.map(|t| self.redact(t))
    }
}
