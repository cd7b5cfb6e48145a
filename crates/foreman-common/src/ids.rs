//! Identifier newtypes.
//!
//! All identifiers render in a stable, human-typable form (`T03`, `M1`,
//! `AUTH-002`, `DF-007`) and parse back from that form, so the same values can
//! travel through the CLI, JSON plans and the SQLite store unchanged.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("invalid task id '{0}': expected T<number> (e.g. T03)")]
    Task(String),
    #[error("invalid milestone id '{0}': must be non-empty and contain no whitespace")]
    Milestone(String),
    #[error("invalid decision id '{0}': expected a 4-letter upper-case tag and ordinal (e.g. AUTH-001)")]
    Decision(String),
    #[error("invalid finding id '{0}': expected DF-<number> (e.g. DF-001)")]
    Finding(String),
}

/// Queue-ordinal identifier of a task.
///
/// Ordering follows the ordinal, which is also the execution queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u32);

impl TaskId {
    pub const fn new(ordinal: u32) -> Self {
        Self(ordinal)
    }

    pub fn ordinal(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:02}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('T')
            .or_else(|| trimmed.strip_prefix('t'))
            .unwrap_or(trimmed);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(IdError::Task(s.to_string()));
        }
        digits
            .parse::<u32>()
            .map(TaskId)
            .map_err(|_| IdError::Task(s.to_string()))
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Plans written by hand use either `3` or `"T03"`.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(TaskId(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Identifier of a milestone (free-form label such as `M1` or `auth-core`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MilestoneId(String);

impl MilestoneId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MilestoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MilestoneId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(IdError::Milestone(s.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl<'de> Deserialize<'de> for MilestoneId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Producer-prefixed decision identifier: a 4-letter tag plus an ordinal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct DecisionId(String);

impl DecisionId {
    /// Build an id from a tag and ordinal. The tag must already be valid.
    pub fn new(tag: &str, ordinal: u32) -> Result<Self, IdError> {
        format!("{}-{:03}", tag, ordinal).parse()
    }

    /// The 4-letter producer tag.
    pub fn tag(&self) -> &str {
        &self.0[..4]
    }

    /// The numeric ordinal within the producer's sequence.
    pub fn ordinal(&self) -> u32 {
        // Validated on construction: everything after "TAG-" is ASCII digits.
        self.0[5..].parse().unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_valid(s: &str) -> bool {
        let bytes = s.as_bytes();
        bytes.len() >= 7
            && bytes[..4].iter().all(u8::is_ascii_uppercase)
            && bytes[4] == b'-'
            && bytes[5..].iter().all(u8::is_ascii_digit)
    }
}

impl fmt::Display for DecisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DecisionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if Self::is_valid(trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(IdError::Decision(s.to_string()))
        }
    }
}

impl<'de> Deserialize<'de> for DecisionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of a deferred finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FindingId(u32);

impl FindingId {
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn number(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DF-{:03}", self.0)
    }
}

impl FromStr for FindingId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .strip_prefix("DF-")
            .and_then(|n| n.parse::<u32>().ok())
            .map(FindingId)
            .ok_or_else(|| IdError::Finding(s.to_string()))
    }
}

impl Serialize for FindingId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FindingId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_round_trips_through_display() {
        let id: TaskId = "T03".parse().unwrap();
        assert_eq!(id.ordinal(), 3);
        assert_eq!(id.to_string(), "T03");
        assert_eq!("t7".parse::<TaskId>().unwrap(), TaskId::new(7));
        assert_eq!("12".parse::<TaskId>().unwrap(), TaskId::new(12));
        assert!("T".parse::<TaskId>().is_err());
        assert!("T-1".parse::<TaskId>().is_err());
    }

    #[test]
    fn task_id_deserializes_from_number_or_string() {
        let ids: Vec<TaskId> = serde_json::from_str(r#"[1, "T02", "3"]"#).unwrap();
        assert_eq!(ids, vec![TaskId::new(1), TaskId::new(2), TaskId::new(3)]);
        assert_eq!(serde_json::to_string(&TaskId::new(4)).unwrap(), r#""T04""#);
    }

    #[test]
    fn task_ids_order_by_ordinal() {
        let mut ids = vec![TaskId::new(10), TaskId::new(2), TaskId::new(7)];
        ids.sort();
        assert_eq!(ids, vec![TaskId::new(2), TaskId::new(7), TaskId::new(10)]);
    }

    #[test]
    fn decision_id_exposes_tag_and_ordinal() {
        let id: DecisionId = "AUTH-012".parse().unwrap();
        assert_eq!(id.tag(), "AUTH");
        assert_eq!(id.ordinal(), 12);
        assert_eq!(DecisionId::new("DATA", 4).unwrap().as_str(), "DATA-004");
    }

    #[test]
    fn decision_id_rejects_malformed_values() {
        for bad in ["auth-001", "AUT-001", "AUTH001", "AUTH-1", "AUTH-00a", ""] {
            assert!(bad.parse::<DecisionId>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn milestone_id_rejects_whitespace() {
        assert!("M1".parse::<MilestoneId>().is_ok());
        assert!("".parse::<MilestoneId>().is_err());
        assert!("M 1".parse::<MilestoneId>().is_err());
    }

    #[test]
    fn finding_id_formats_with_padding() {
        let id = FindingId::new(7);
        assert_eq!(id.to_string(), "DF-007");
        assert_eq!("DF-007".parse::<FindingId>().unwrap(), id);
        assert!("7".parse::<FindingId>().is_err());
    }
}
