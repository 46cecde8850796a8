use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Spoken when neither the caller nor the parser supplied a message.
pub const DEFAULT_GREETING: &str = "Hello! This is a test call from Autodialer.";

/// Default message for bulk dispatch.
pub const DEFAULT_BULK_MESSAGE: &str = "Hello from Autodialer";

/// Hard cap on spoken text, in characters.
pub const MAX_MESSAGE_CHARS: usize = 280;

/// Store-assigned record identifier. Increases with creation order.
pub type RecordId = i64;

static INDIAN_MOBILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\+91)?0?([6-9]\d{9})").expect("static regex"));

/// Canonical `+91XXXXXXXXXX` phone number.
///
/// Only [`PhoneNumber::normalize`] constructs one, so every value in the
/// system is already canonical.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Find an Indian mobile number in `raw` and return it in canonical form.
    ///
    /// Everything except digits and `+` is stripped first, then the first
    /// `(+91)?0?[6-9]\d{9}` run wins. Normalizing a canonical number returns
    /// it unchanged.
    pub fn normalize(raw: &str) -> Option<Self> {
        let compact: String = raw
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '+')
            .collect();
        let caps = INDIAN_MOBILE.captures(&compact)?;
        Some(Self(format!("+91{}", &caps[2])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The ten subscriber digits without the country prefix.
    pub fn national(&self) -> &str {
        &self.0[3..]
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PhoneNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        PhoneNumber::normalize(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("not an Indian mobile number: {raw}")))
    }
}

/// Trim, cap at [`MAX_MESSAGE_CHARS`] characters, and fall back to the greeting.
pub fn sanitize_message(raw: &str) -> String {
    let trimmed = raw.trim();
    let capped: String = trimmed.chars().take(MAX_MESSAGE_CHARS).collect();
    if capped.is_empty() {
        DEFAULT_GREETING.to_string()
    } else {
        capped
    }
}

/// Dispatch status of a phone record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Calling,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Calling => "calling",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown call status: {}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for CallStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CallStatus::Pending),
            "calling" => Ok(CallStatus::Calling),
            "completed" => Ok(CallStatus::Completed),
            "failed" => Ok(CallStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A dialable number and where it stands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhoneRecord {
    pub id: RecordId,
    pub number: PhoneNumber,
    pub status: CallStatus,
    /// Provider call id, set when a dispatch is accepted.
    pub call_reference_id: Option<String>,
    pub called_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One accepted dispatch. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub id: i64,
    pub phone_record_id: RecordId,
    /// Provider-reported status at dispatch time, e.g. `queued`.
    pub status: String,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewCallAttempt {
    pub phone_record_id: RecordId,
    pub status: String,
    pub message: String,
    pub started_at: DateTime<Utc>,
}

/// Parsed `{phone, message}` pair used to drive a dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallIntent {
    pub phone: Option<PhoneNumber>,
    pub message: String,
}

impl CallIntent {
    pub fn new(phone: Option<PhoneNumber>, message: &str) -> Self {
        Self {
            phone,
            message: sanitize_message(message),
        }
    }
}

/// Record counts by status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: usize,
    pub pending: usize,
    pub calling: usize,
    pub completed: usize,
    pub failed: usize,
}

impl Statistics {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a PhoneRecord>) -> Self {
        let mut stats = Statistics::default();
        for r in records {
            stats.total += 1;
            match r.status {
                CallStatus::Pending => stats.pending += 1,
                CallStatus::Calling => stats.calling += 1,
                CallStatus::Completed => stats.completed += 1,
                CallStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_common_spellings() {
        for raw in [
            "9876543210",
            "+919876543210",
            "09876543210",
            "+91 98765 43210",
            "(987) 654-3210",
        ] {
            let n = PhoneNumber::normalize(raw).expect(raw);
            assert_eq!(n.as_str(), "+919876543210", "{raw}");
        }
    }

    #[test]
    fn rejects_non_mobile_numbers() {
        assert!(PhoneNumber::normalize("").is_none());
        assert!(PhoneNumber::normalize("hello there").is_none());
        assert!(PhoneNumber::normalize("1234567890").is_none());
        assert!(PhoneNumber::normalize("98765").is_none());
    }

    #[test]
    fn national_strips_prefix() {
        let n = PhoneNumber::normalize("7000000001").unwrap();
        assert_eq!(n.national(), "7000000001");
    }

    #[test]
    fn deserialize_normalizes() {
        let n: PhoneNumber = serde_json::from_str("\"098765 43210\"").unwrap();
        assert_eq!(n.as_str(), "+919876543210");
        assert!(serde_json::from_str::<PhoneNumber>("\"12\"").is_err());
    }

    #[test]
    fn sanitize_defaults_blank() {
        assert_eq!(sanitize_message("   "), DEFAULT_GREETING);
        assert_eq!(sanitize_message("  hi  "), "hi");
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            CallStatus::Pending,
            CallStatus::Calling,
            CallStatus::Completed,
            CallStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<CallStatus>().unwrap(), s);
        }
        assert!("queued".parse::<CallStatus>().is_err());
    }

    proptest! {
        #[test]
        fn ten_digit_mobiles_get_prefixed(lead in 6u8..=9, rest in "[0-9]{9}") {
            let s = format!("{lead}{rest}");
            let n = PhoneNumber::normalize(&s).unwrap();
            prop_assert_eq!(n.as_str(), format!("+91{s}"));
            let again = PhoneNumber::normalize(n.as_str()).unwrap();
            prop_assert_eq!(again, n);
        }

        #[test]
        fn long_messages_are_capped(body in "[a-zA-Z0-9]{281,600}") {
            prop_assert_eq!(sanitize_message(&body).chars().count(), MAX_MESSAGE_CHARS);
        }

        #[test]
        fn digitless_text_has_no_number(text in "[a-zA-Z ,.!?]{0,80}") {
            prop_assert!(PhoneNumber::normalize(&text).is_none());
        }
    }
}
