//! Core domain model for CAST: advisory documents, matches and their lifecycles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cast-core";

/// Display titles standing in for a real title while a fetch is pending or
/// after it went wrong. Kept for UI parity; the authoritative fetch state is
/// [`DocumentStatus`].
pub const TITLE_LOADING: &str = "Loading...";
pub const TITLE_FAILED: &str = "Loading Failed.";
pub const TITLE_NOT_FOUND: &str = "No Document Found";
pub const TITLE_UNTITLED: &str = "No Title";

/// Field caps, in characters. Overlong values are truncated, never rejected.
pub const DOCURL_MAX_LEN: usize = 1000;
pub const TITLE_MAX_LEN: usize = 100;
pub const VERSION_MAX_LEN: usize = 50;
pub const LANG_MAX_LEN: usize = 20;
pub const PUBLISHER_MAX_LEN: usize = 100;

/// Fetch lifecycle of an advisory document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Loaded,
    Failed,
    NotFound,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
            Self::NotFound => "not_found",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "loaded" => Some(Self::Loaded),
            "failed" => Some(Self::Failed),
            "not_found" => Some(Self::NotFound),
            _ => None,
        }
    }

    /// Statuses the background refresher picks up again.
    pub fn is_refreshable(self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }
}

/// Reference to a CSAF advisory document. The document body lives in a remote
/// cache; only the main fields are tracked here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryDocument {
    pub id: i64,
    pub docurl: String,
    pub title: String,
    pub version: Option<String>,
    pub lang: Option<String>,
    pub publisher: Option<String>,
    pub status: DocumentStatus,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Workflow state of an advisory-to-asset match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    New,
    Confirmed,
    Resolved,
    FalsePositive,
    Reopened,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Confirmed => "confirmed",
            Self::Resolved => "resolved",
            Self::FalsePositive => "false_positive",
            Self::Reopened => "reopened",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "confirmed" => Some(Self::Confirmed),
            "resolved" => Some(Self::Resolved),
            "false_positive" => Some(Self::FalsePositive),
            "reopened" => Some(Self::Reopened),
            _ => None,
        }
    }

    /// Open matches count against an asset; resolved/dismissed ones do not.
    pub fn is_open(self) -> bool {
        matches!(self, Self::New | Self::Confirmed | Self::Reopened)
    }
}

/// Composite identity of a match. All four components must be equal for two
/// detections to refer to the same match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchKey {
    pub document_id: i64,
    pub device_id: Option<i64>,
    pub software_id: Option<i64>,
    pub product_name_id: Option<String>,
}

/// An association between an advisory document and a device or software
/// asset, carrying a confidence score and an append-only description log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryMatch {
    pub id: i64,
    pub document_id: i64,
    pub device_id: Option<i64>,
    pub software_id: Option<i64>,
    pub product_name_id: Option<String>,
    pub score: f64,
    pub time: DateTime<Utc>,
    pub status: MatchStatus,
    pub description: String,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl AdvisoryMatch {
    pub fn key(&self) -> MatchKey {
        MatchKey {
            document_id: self.document_id,
            device_id: self.device_id,
            software_id: self.software_id,
            product_name_id: self.product_name_id.clone(),
        }
    }
}

/// Truncate to at most `max` characters. Returns the value and whether it was
/// cut; callers log the cut with field context.
pub fn truncate_chars(value: &str, max: usize) -> (String, bool) {
    if value.chars().count() <= max {
        return (value.to_string(), false);
    }
    (value.chars().take(max).collect(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Loaded,
            DocumentStatus::Failed,
            DocumentStatus::NotFound,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            MatchStatus::New,
            MatchStatus::Confirmed,
            MatchStatus::Resolved,
            MatchStatus::FalsePositive,
            MatchStatus::Reopened,
        ] {
            assert_eq!(MatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DocumentStatus::parse("bogus"), None);
        assert_eq!(MatchStatus::parse("bogus"), None);
    }

    #[test]
    fn truncate_is_exact_and_char_aware() {
        let (kept, cut) = truncate_chars("short", 10);
        assert_eq!(kept, "short");
        assert!(!cut);

        let long = "x".repeat(150);
        let (kept, cut) = truncate_chars(&long, TITLE_MAX_LEN);
        assert_eq!(kept.chars().count(), TITLE_MAX_LEN);
        assert!(cut);

        let umlauts = "ü".repeat(30);
        let (kept, cut) = truncate_chars(&umlauts, 20);
        assert_eq!(kept.chars().count(), 20);
        assert!(cut);
    }

    #[test]
    fn match_key_compares_all_four_components() {
        let base = MatchKey {
            document_id: 1,
            device_id: Some(2),
            software_id: None,
            product_name_id: Some("vendor/product".into()),
        };
        let same = base.clone();
        assert_eq!(base, same);

        let other_product = MatchKey {
            product_name_id: Some("vendor/other".into()),
            ..base.clone()
        };
        assert_ne!(base, other_product);

        let missing_device = MatchKey {
            device_id: None,
            ..base.clone()
        };
        assert_ne!(base, missing_device);
    }
}
