use regex::{Captures, Regex};
use std::fmt;

/// Redacts credentials from free text before it leaves the governor.
///
/// Applied to developer messages and to the `original_error` carried in
/// telemetry, both of which echo user-supplied error output.
#[derive(Clone)]
pub struct SecretScrubber {
    api_key_pattern: Regex,
    token_pattern: Regex,
    bearer_pattern: Regex,
    password_pattern: Regex,
}

impl SecretScrubber {
    /// Compile the redaction patterns.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // Provider API keys: sk-ant-..., sk-proj-..., sk-...
            api_key_pattern: Regex::new(r"sk-(?:ant-|proj-)?[a-zA-Z0-9_-]{20,}")?,
            token_pattern: Regex::new(
                r#"["']?(?:api_key|apikey|token|secret)["']?\s*[:=]\s*["']?[a-zA-Z0-9_.-]{8,}["']?"#,
            )?,
            bearer_pattern: Regex::new(r"Bearer\s+[a-zA-Z0-9_.-]+")?,
            password_pattern: Regex::new(r#"["']?password["']?\s*[:=]\s*["']?[^"'\s,}]+["']?"#)?,
        })
    }

    /// Scrub a message of sensitive data
    pub fn scrub(&self, message: &str) -> String {
        let scrubbed = self
            .api_key_pattern
            .replace_all(message, "[API_KEY_REDACTED]");
        let scrubbed = self
            .bearer_pattern
            .replace_all(&scrubbed, "Bearer [TOKEN_REDACTED]");
        let scrubbed = self.token_pattern.replace_all(&scrubbed, |caps: &Captures| {
            let full_match = &caps[0];
            full_match
                .find([':', '='])
                .map_or_else(
                    || "[REDACTED]".to_string(),
                    |pos| format!("{}{}[REDACTED]", &full_match[..pos], &full_match[pos..=pos]),
                )
        });
        self.password_pattern
            .replace_all(&scrubbed, "password=[REDACTED]")
            .into_owned()
    }

    /// Whether `message` contains anything that would be redacted.
    pub fn contains_secret(&self, message: &str) -> bool {
        self.api_key_pattern.is_match(message)
            || self.bearer_pattern.is_match(message)
            || self.token_pattern.is_match(message)
            || self.password_pattern.is_match(message)
    }
}

impl fmt::Debug for SecretScrubber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretScrubber").finish()
    }
}
