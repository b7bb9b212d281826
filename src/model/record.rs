use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Matches a canonical record reference like `group/proj#12` or `group/proj!34`.
static REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z0-9_./-]+)([#!])([0-9]+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Issue,
    MergeRequest,
}

impl RecordKind {
    pub fn sigil(&self) -> char {
        match self {
            RecordKind::Issue => '#',
            RecordKind::MergeRequest => '!',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Open,
    Closed,
    Merged,
}

impl RecordState {
    pub fn is_open(&self) -> bool {
        matches!(self, RecordState::Open)
    }
}

/// Identity of one tracker record.
///
/// The kind sigil is part of the identity: issue and merge-request numbering
/// overlap in the tracker, so `proj#12` and `proj!12` are different records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RecordId {
    pub project: String,
    pub kind: RecordKind,
    pub number: u64,
}

impl RecordId {
    pub fn issue(project: &str, number: u64) -> Self {
        Self {
            project: project.to_string(),
            kind: RecordKind::Issue,
            number,
        }
    }

    pub fn merge_request(project: &str, number: u64) -> Self {
        Self {
            project: project.to_string(),
            kind: RecordKind::MergeRequest,
            number,
        }
    }

    /// Find the first record reference embedded in free-form text, if any.
    pub fn find_in_text(text: &str) -> Option<RecordId> {
        let caps = REF_RE.captures(text)?;
        let kind = match &caps[2] {
            "#" => RecordKind::Issue,
            _ => RecordKind::MergeRequest,
        };
        let number: u64 = caps[3].parse().ok()?;
        Some(RecordId {
            project: caps[1].to_string(),
            kind,
            number,
        })
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.project, self.kind.sigil(), self.number)
    }
}

impl FromStr for RecordId {
    type Err = MalformedReference;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let split_at = s
            .rfind(['#', '!'])
            .ok_or_else(|| MalformedReference(s.to_string()))?;
        let (project, rest) = s.split_at(split_at);
        if project.is_empty() {
            return Err(MalformedReference(s.to_string()));
        }
        let kind = if rest.starts_with('#') {
            RecordKind::Issue
        } else {
            RecordKind::MergeRequest
        };
        let number: u64 = rest[1..]
            .parse()
            .map_err(|_| MalformedReference(s.to_string()))?;
        Ok(RecordId {
            project: project.to_string(),
            kind,
            number,
        })
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for RecordId {
    type Error = MalformedReference;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("not a well-formed record reference: '{0}'")]
pub struct MalformedReference(pub String);

/// Immutable snapshot of one tracker record for a single reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    pub state: RecordState,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Marked as a draft/work-in-progress by the author (change requests).
    #[serde(default)]
    pub draft: bool,
    pub url: Option<String>,
    /// When the oldest still-unresolved discussion thread was opened, if the
    /// tracker reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_unresolved_discussion: Option<DateTime<Utc>>,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        self.id.kind
    }
}

/// Directed relationship between two records, as reported by the tracker.
///
/// Inverse pairs (blocks/blocked-by) may arrive as one edge or both; nothing
/// downstream may assume both directions are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub from: RecordId,
    pub to: RecordId,
    pub kind: LinkKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Blocks,
    BlockedBy,
    RelatesTo,
    PartOf,
    DuplicateOf,
    /// A kind this tool does not understand. Ignored with a warning, so new
    /// tracker link types fail closed instead of matching an unintended case.
    Unknown(String),
}

impl LinkKind {
    pub fn parse(raw: &str) -> LinkKind {
        match raw {
            "blocks" => LinkKind::Blocks,
            "is_blocked_by" | "blocked_by" => LinkKind::BlockedBy,
            "relates_to" => LinkKind::RelatesTo,
            "part_of" => LinkKind::PartOf,
            "duplicate_of" | "duplicates" => LinkKind::DuplicateOf,
            other => LinkKind::Unknown(other.to_string()),
        }
    }

    /// Kinds that group records into one unit of work. Blocking links never
    /// imply grouping.
    pub fn is_grouping(&self) -> bool {
        matches!(self, LinkKind::PartOf | LinkKind::RelatesTo)
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, LinkKind::Blocks | LinkKind::BlockedBy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ref_round_trips() {
        let id = RecordId::issue("openxr/openxr", 123);
        assert_eq!(id.to_string(), "openxr/openxr#123");
        assert_eq!("openxr/openxr#123".parse::<RecordId>().unwrap(), id);

        let mr = RecordId::merge_request("openxr/openxr", 45);
        assert_eq!(mr.to_string(), "openxr/openxr!45");
        assert_eq!("openxr/openxr!45".parse::<RecordId>().unwrap(), mr);
    }

    #[test]
    fn issue_and_mr_with_same_number_differ() {
        assert_ne!(
            RecordId::issue("p", 7),
            RecordId::merge_request("p", 7)
        );
    }

    #[test]
    fn malformed_refs_rejected() {
        assert!("no-sigil-here".parse::<RecordId>().is_err());
        assert!("#12".parse::<RecordId>().is_err());
        assert!("proj#notanumber".parse::<RecordId>().is_err());
    }

    #[test]
    fn find_in_text_picks_first_ref() {
        let found = RecordId::find_in_text("• proj!45: fix the frobnicator https://x").unwrap();
        assert_eq!(found, RecordId::merge_request("proj", 45));
        assert!(RecordId::find_in_text("a manual note, no refs").is_none());
    }

    #[test]
    fn unknown_link_kind_fails_closed() {
        assert_eq!(LinkKind::parse("blocks"), LinkKind::Blocks);
        assert_eq!(LinkKind::parse("is_blocked_by"), LinkKind::BlockedBy);
        match LinkKind::parse("mentioned_in") {
            LinkKind::Unknown(raw) => assert_eq!(raw, "mentioned_in"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn grouping_excludes_blocking() {
        assert!(LinkKind::PartOf.is_grouping());
        assert!(LinkKind::RelatesTo.is_grouping());
        assert!(!LinkKind::Blocks.is_grouping());
        assert!(!LinkKind::DuplicateOf.is_grouping());
    }
}
