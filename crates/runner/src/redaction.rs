//! Redaction of inference language in free-text notes
//!
//! Notes are operator commentary and must not carry conclusions about the
//! page or its owner into the evidence record. Banned terms are matched
//! case-insensitively on word boundaries and replaced with a placeholder
//! that itself contains no banned term, so redaction is idempotent.

use regex::Regex;

use crate::error::FlowError;

pub const REDACTION_PLACEHOLDER: &str = "[REDACTED]";

/// Fixed list of inference terms removed from notes
pub const BANNED_TERMS: &[&str] = &[
    "fraud",
    "fraudulent",
    "scam",
    "scammer",
    "fake",
    "counterfeit",
    "illegal",
    "unlawful",
    "malicious",
    "deceptive",
    "misleading",
    "criminal",
    "suspicious",
    "guilty",
    "intentionally",
    "deliberately",
];

/// Result of redacting one text field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redacted {
    pub text: String,
    /// Number of substitutions made
    pub redactions: usize,
    /// Length of the input in characters
    pub original_length: usize,
}

impl Redacted {
    pub fn changed(&self) -> bool {
        self.redactions > 0
    }
}

#[derive(Debug, Clone)]
pub struct Redactor {
    pattern: Regex,
}

impl Redactor {
    /// Redactor over [`BANNED_TERMS`]
    pub fn standard() -> Result<Self, FlowError> {
        Self::with_terms(BANNED_TERMS)
    }

    pub fn with_terms(terms: &[&str]) -> Result<Self, FlowError> {
        let alternation: Vec<String> = terms.iter().map(|t| regex::escape(t)).collect();
        let pattern = Regex::new(&format!(r"(?i)\b(?:{})\b", alternation.join("|")))
            .map_err(|e| FlowError::Schema(format!("invalid redaction pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    pub fn redact(&self, text: &str) -> Redacted {
        let original_length = text.chars().count();
        let redactions = self.pattern.find_iter(text).count();
        let text = if redactions == 0 {
            text.to_string()
        } else {
            self.pattern
                .replace_all(text, REDACTION_PLACEHOLDER)
                .into_owned()
        };
        Redacted {
            text,
            redactions,
            original_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Looks like a SCAM page", "Looks like a [REDACTED] page", 1 ; "uppercase")]
    #[test_case("fake, fraudulent listing", "[REDACTED], [REDACTED] listing", 2 ; "punctuation boundaries")]
    #[test_case("Scammers everywhere", "Scammers everywhere", 0 ; "no partial word")]
    #[test_case("defaker and fakes", "defaker and fakes", 0 ; "embedded terms untouched")]
    #[test_case("checkout button clicked", "checkout button clicked", 0 ; "clean note")]
    fn test_redact(input: &str, expected: &str, count: usize) {
        let redactor = Redactor::standard().unwrap();
        let out = redactor.redact(input);
        assert_eq!(out.text, expected);
        assert_eq!(out.redactions, count);
        assert_eq!(out.original_length, input.chars().count());
    }

    #[test]
    fn test_redaction_is_idempotent() {
        let redactor = Redactor::standard().unwrap();
        for input in [
            "malicious and deceptive banner",
            "nothing to see",
            "[REDACTED] already",
            "Suspicious Criminal GUILTY",
        ] {
            let once = redactor.redact(input);
            let twice = redactor.redact(&once.text);
            assert_eq!(once.text, twice.text);
            assert!(!twice.changed());
        }
    }

    #[test]
    fn test_placeholder_contains_no_banned_term() {
        let redactor = Redactor::standard().unwrap();
        assert!(!redactor.redact(REDACTION_PLACEHOLDER).changed());
    }
}
