use once_cell::sync::Lazy;
use regex::Regex;

use autodialer_types::{sanitize_message, CallIntent, PhoneNumber, DEFAULT_GREETING};

// `$` is end of line, so the captured message never spans lines.
static MESSAGE_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)\b(?:say|message|tell|speak|announce)\b[:\-]?\s*(.+)$")
        .expect("static regex")
});

/// Deterministic extractor used when the LLM stage is unavailable.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleBasedParser;

impl RuleBasedParser {
    pub fn parse(&self, text: &str) -> CallIntent {
        CallIntent {
            phone: PhoneNumber::normalize(text),
            message: extract_message(text),
        }
    }
}

/// Text after the first speech keyword, or the default greeting.
pub fn extract_message(text: &str) -> String {
    match MESSAGE_KEYWORD.captures(text) {
        Some(caps) => sanitize_message(&caps[1]),
        None => DEFAULT_GREETING.to_string(),
    }
}
