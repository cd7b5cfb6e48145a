//! Reviewer verdicts and the aggregate outcomes derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One reviewer's outcome for one cycle.
///
/// `Unavailable` is not a judgment: it records that the reviewer timed out or
/// failed, and it never counts as a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewVerdict {
    Pass,
    Concern,
    Block,
    Unavailable,
}

impl ReviewVerdict {
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block)
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Concern => "concern",
            Self::Block => "block",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ReviewVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReviewVerdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pass" => Ok(Self::Pass),
            "concern" | "warn" => Ok(Self::Concern),
            "block" | "fail" => Ok(Self::Block),
            "unavailable" => Ok(Self::Unavailable),
            _ => anyhow::bail!(
                "Invalid verdict '{}'. Valid values: pass, concern, block, unavailable",
                s
            ),
        }
    }
}

/// Aggregate verdict over every reviewer of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateKind {
    Pass,
    Concern,
    Block,
}

impl AggregateKind {
    /// Fold individual verdicts: any block wins, then any concern, else pass.
    /// Unavailable outcomes are ignored here; callers surface them as gaps.
    pub fn from_verdicts<'a>(verdicts: impl IntoIterator<Item = &'a ReviewVerdict>) -> Self {
        let mut aggregate = Self::Pass;
        for verdict in verdicts {
            match verdict {
                ReviewVerdict::Block => return Self::Block,
                ReviewVerdict::Concern => aggregate = Self::Concern,
                ReviewVerdict::Pass | ReviewVerdict::Unavailable => {}
            }
        }
        aggregate
    }

    pub fn allows_progression(&self) -> bool {
        !matches!(self, Self::Block)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Concern => "CONCERN",
            Self::Block => "BLOCK",
        }
    }
}

impl fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregateKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PASS" => Ok(Self::Pass),
            "CONCERN" => Ok(Self::Concern),
            "BLOCK" => Ok(Self::Block),
            _ => anyhow::bail!("Invalid aggregate verdict '{}'. Valid values: PASS, CONCERN, BLOCK", s),
        }
    }
}

/// Outcome of a milestone integration review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MilestoneVerdict {
    /// Integration checks passed; the milestone is complete.
    MilestoneComplete,
    /// Blocked, but the milestone still has fix cycles left.
    NeedsFix,
    /// Blocked at the ceiling. Always escalated to the operator.
    Blocked,
}

impl MilestoneVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MilestoneComplete => "MILESTONE_COMPLETE",
            Self::NeedsFix => "NEEDS_FIX",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for MilestoneVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_block_wins() {
        let verdicts = [ReviewVerdict::Pass, ReviewVerdict::Block, ReviewVerdict::Concern];
        assert_eq!(AggregateKind::from_verdicts(&verdicts), AggregateKind::Block);
    }

    #[test]
    fn concern_without_block_is_concern() {
        let verdicts = [ReviewVerdict::Pass, ReviewVerdict::Concern];
        assert_eq!(AggregateKind::from_verdicts(&verdicts), AggregateKind::Concern);
    }

    #[test]
    fn all_pass_is_pass_and_unavailable_is_ignored() {
        let verdicts = [ReviewVerdict::Pass, ReviewVerdict::Unavailable];
        assert_eq!(AggregateKind::from_verdicts(&verdicts), AggregateKind::Pass);
        assert_eq!(AggregateKind::from_verdicts(&[]), AggregateKind::Pass);
    }

    #[test]
    fn verdict_parses_aliases() {
        assert_eq!("FAIL".parse::<ReviewVerdict>().unwrap(), ReviewVerdict::Block);
        assert_eq!("warn".parse::<ReviewVerdict>().unwrap(), ReviewVerdict::Concern);
        assert!("maybe".parse::<ReviewVerdict>().is_err());
    }

    #[test]
    fn milestone_verdict_display_matches_wire_form() {
        assert_eq!(MilestoneVerdict::MilestoneComplete.to_string(), "MILESTONE_COMPLETE");
        assert_eq!(
            serde_json::to_string(&MilestoneVerdict::Blocked).unwrap(),
            r#""BLOCKED""#
        );
    }
}
