//! Pairwise conflict detection within concern clusters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use foreman_common::DecisionId;
use serde::{Deserialize, Serialize};

use super::rules::{Profile, RuleSet, capability_matches};
use super::{ConcernIndex, Decision};
use crate::chain::digest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Mutually exclusive implementations of the same concern.
    DirectContradiction,
    /// Architecturally at odds without being strictly exclusive.
    ImplementationTension,
    /// Competing numeric or budget constraints.
    ResourceConflict,
    /// Two decisions claim authority over the same mechanism.
    OwnershipOverlap,
    /// One decision assumes a capability another does not provide.
    ImplicitDependencyGap,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectContradiction => "direct_contradiction",
            Self::ImplementationTension => "implementation_tension",
            Self::ResourceConflict => "resource_conflict",
            Self::OwnershipOverlap => "ownership_overlap",
            Self::ImplicitDependencyGap => "implicit_dependency_gap",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().replace('_', " "))
    }
}

impl FromStr for ConflictKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "direct_contradiction" => Ok(Self::DirectContradiction),
            "implementation_tension" => Ok(Self::ImplementationTension),
            "resource_conflict" => Ok(Self::ResourceConflict),
            "ownership_overlap" => Ok(Self::OwnershipOverlap),
            "implicit_dependency_gap" => Ok(Self::ImplicitDependencyGap),
            _ => anyhow::bail!("Unknown conflict kind '{}'", s),
        }
    }
}

/// A candidate conflict for human resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Fingerprint over kind, participants (with revisions) and rule key.
    pub id: String,
    pub kind: ConflictKind,
    pub decisions: Vec<DecisionId>,
    /// Concern clusters in which the pair was found.
    pub concerns: BTreeSet<String>,
    pub rule: String,
    pub detail: String,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.decisions.iter().map(|d| d.as_str()).collect();
        write!(f, "{} [{}] {}: {}", self.id, self.kind, ids.join(" vs "), self.detail)
    }
}

struct Candidate {
    kind: ConflictKind,
    rule: String,
    detail: String,
}

fn fingerprint(kind: ConflictKind, participants: &[&Decision], rule: &str) -> String {
    let members: Vec<String> = participants
        .iter()
        .map(|d| format!("{}@{}", d.id, d.revision))
        .collect();
    let hash = digest::digest_str(&format!("{}|{}|{}", kind.as_str(), members.join("|"), rule));
    format!("CONF-{}", &hash[..8])
}

fn list(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn compare(a: &Decision, pa: &Profile, b: &Decision, pb: &Profile) -> Vec<Candidate> {
    let mut out = Vec::new();

    for (group, ma) in &pa.choices {
        let Some((_, mb)) = pb.choices.iter().find(|(g, _)| g == group) else {
            continue;
        };
        let disjoint_choices =
            !ma.chosen.is_empty() && !mb.chosen.is_empty() && ma.chosen.is_disjoint(&mb.chosen);
        let detail = if disjoint_choices {
            Some(format!(
                "{} chooses {}; {} chooses {} ({})",
                a.id,
                list(&ma.chosen),
                b.id,
                list(&mb.chosen),
                group
            ))
        } else if !ma.chosen.is_disjoint(&mb.rejected) {
            Some(format!("{} chooses what {} rules out ({})", a.id, b.id, group))
        } else if !ma.rejected.is_disjoint(&mb.chosen) {
            Some(format!("{} chooses what {} rules out ({})", b.id, a.id, group))
        } else {
            None
        };
        if let Some(detail) = detail {
            out.push(Candidate {
                kind: ConflictKind::DirectContradiction,
                rule: group.clone(),
                detail,
            });
        }
    }

    for (name, side_a) in &pa.tensions {
        if let Some((_, side_b)) = pb.tensions.iter().find(|(n, _)| n == name) {
            if side_a != side_b {
                out.push(Candidate {
                    kind: ConflictKind::ImplementationTension,
                    rule: name.clone(),
                    detail: format!("{} and {} sit on opposite sides of {}", a.id, b.id, name),
                });
            }
        }
    }

    for ca in &pa.constraints {
        for cb in &pb.constraints {
            if !ca.compatible_with(cb) {
                out.push(Candidate {
                    kind: ConflictKind::ResourceConflict,
                    rule: ca.metric.clone(),
                    detail: format!(
                        "{} requires {}; {} requires {}",
                        a.id,
                        ca.describe(),
                        b.id,
                        cb.describe()
                    ),
                });
            }
        }
    }

    for (owner_a, what_a) in &pa.ownership {
        for (owner_b, what_b) in &pb.ownership {
            if owner_a != owner_b && capability_matches(what_a, what_b) {
                let rule = if (what_a.len(), what_a) <= (what_b.len(), what_b) {
                    what_a
                } else {
                    what_b
                };
                out.push(Candidate {
                    kind: ConflictKind::OwnershipOverlap,
                    rule: rule.clone(),
                    detail: format!(
                        "{} gives {} to {}; {} gives it to {}",
                        a.id, rule, owner_a, b.id, owner_b
                    ),
                });
            }
        }
    }

    for (needs, needer, lacks, lacker) in [(pa, a, pb, b), (pb, b, pa, a)] {
        for required in &needs.requires {
            if lacks.lacks.iter().any(|missing| capability_matches(required, missing)) {
                out.push(Candidate {
                    kind: ConflictKind::ImplicitDependencyGap,
                    rule: required.clone(),
                    detail: format!(
                        "{} relies on {}, which {} does not provide",
                        needer.id, required, lacker.id
                    ),
                });
            }
        }
    }

    out
}

/// Detect candidate conflicts among the decisions named by `index`.
///
/// Deterministic: the result depends only on the set of decisions (ids,
/// revisions, text, tags), never on insertion or iteration order.
pub fn detect(
    index: &ConcernIndex,
    decisions: &BTreeMap<DecisionId, Decision>,
    rules: &RuleSet,
) -> Vec<Conflict> {
    let mut profiles: BTreeMap<&DecisionId, Profile> = BTreeMap::new();
    for ids in index.values() {
        for id in ids {
            if let Some(decision) = decisions.get(id) {
                profiles
                    .entry(&decision.id)
                    .or_insert_with(|| rules.profile(&decision.text));
            }
        }
    }

    let mut found: BTreeMap<String, Conflict> = BTreeMap::new();
    let mut record = |concern: &str, participants: &[&Decision], candidate: Candidate| {
        let id = fingerprint(candidate.kind, participants, &candidate.rule);
        found
            .entry(id.clone())
            .or_insert_with(|| Conflict {
                id,
                kind: candidate.kind,
                decisions: participants.iter().map(|d| d.id.clone()).collect(),
                concerns: BTreeSet::new(),
                rule: candidate.rule,
                detail: candidate.detail,
            })
            .concerns
            .insert(concern.to_string());
    };

    for (concern, ids) in index {
        let members: BTreeSet<&DecisionId> = ids.iter().collect();
        let members: Vec<&Decision> = members.into_iter().filter_map(|id| decisions.get(id)).collect();
        for (i, &a) in members.iter().enumerate() {
            for &b in &members[i + 1..] {
                let (Some(pa), Some(pb)) = (profiles.get(&a.id), profiles.get(&b.id)) else {
                    continue;
                };
                for candidate in compare(a, pa, b, pb) {
                    record(concern, &[a, b], candidate);
                }
            }
        }
    }

    // Requirements nothing in the store speaks to at all.
    for (concern, ids) in index {
        for id in ids {
            let (Some(decision), Some(profile)) = (decisions.get(id), profiles.get(id)) else {
                continue;
            };
            for required in &profile.requires {
                let addressed = profiles.values().any(|other| {
                    other
                        .provides
                        .iter()
                        .chain(other.lacks.iter())
                        .any(|cap| capability_matches(required, cap))
                });
                if !addressed {
                    record(
                        concern,
                        &[decision],
                        Candidate {
                            kind: ConflictKind::ImplicitDependencyGap,
                            rule: required.clone(),
                            detail: format!(
                                "{} relies on {}, which no decision provides",
                                decision.id, required
                            ),
                        },
                    );
                }
            }
        }
    }

    let mut conflicts: Vec<Conflict> = found.into_values().collect();
    conflicts.sort_by(|x, y| {
        (x.kind, &x.decisions, &x.rule, &x.id).cmp(&(y.kind, &y.decisions, &y.rule, &y.id))
    });
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionStatus, build_index};
    use chrono::Utc;
    use proptest::prelude::*;

    fn decision(id: &str, text: &str, tags: &[&str]) -> Decision {
        Decision {
            id: id.parse().unwrap(),
            producer: id[..4].to_lowercase(),
            text: text.to_string(),
            status: DecisionStatus::Confirmed,
            concern_areas: tags.iter().map(|t| t.to_string()).collect(),
            revision: 1,
            amends: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn run(decisions: &[Decision]) -> Vec<Conflict> {
        let map: BTreeMap<DecisionId, Decision> =
            decisions.iter().map(|d| (d.id.clone(), d.clone())).collect();
        detect(&build_index(decisions.iter()), &map, &RuleSet::builtin().unwrap())
    }

    fn auth_decisions() -> Vec<Decision> {
        vec![
            decision("AUTH-001", "Store session tokens in localStorage on the client.", &["authentication"]),
            decision("SECU-001", "Keep session tokens in httpOnly cookies.", &["authentication", "security"]),
            decision("AUTH-002", "Hash passwords with argon2id.", &["authentication"]),
        ]
    }

    #[test]
    fn exclusive_storage_choices_are_one_direct_contradiction() {
        let conflicts = run(&auth_decisions());
        assert_eq!(conflicts.len(), 1, "{conflicts:?}");
        let conflict = &conflicts[0];
        assert_eq!(conflict.kind, ConflictKind::DirectContradiction);
        let ids: Vec<&str> = conflict.decisions.iter().map(|d| d.as_str()).collect();
        assert_eq!(ids, vec!["AUTH-001", "SECU-001"]);
        assert!(conflict.id.starts_with("CONF-"));
    }

    #[test]
    fn pairs_in_different_clusters_do_not_conflict() {
        let conflicts = run(&[
            decision("AUTH-001", "Store session tokens in localStorage.", &["authentication"]),
            decision("UIUX-001", "Remember theme preference in a cookie.", &["theming"]),
        ]);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn pair_sharing_two_clusters_is_reported_once() {
        let conflicts = run(&[
            decision("AUTH-001", "Tokens live in localStorage.", &["authentication", "storage"]),
            decision("SECU-001", "Tokens live in cookies.", &["authentication", "storage"]),
        ]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].concerns.len(), 2);
    }

    #[test]
    fn amending_a_participant_changes_the_fingerprint() {
        let mut decisions = auth_decisions();
        let before = run(&decisions)[0].id.clone();
        decisions[1].revision = 2;
        let after = run(&decisions)[0].id.clone();
        assert_ne!(before, after);
    }

    #[test]
    fn competing_bounds_are_resource_conflicts() {
        let conflicts = run(&[
            decision("PERF-001", "Checkout latency must stay under 200ms.", &["checkout"]),
            decision("PAYM-001", "The payment gateway needs a latency of at least 2 seconds.", &["checkout"]),
        ]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::ResourceConflict);
        assert_eq!(conflicts[0].rule, "latency");
    }

    #[test]
    fn two_owners_of_one_mechanism_overlap() {
        let conflicts = run(&[
            decision("AUTH-001", "The auth service owns session invalidation.", &["sessions"]),
            decision("GATE-001", "The gateway owns session invalidation.", &["sessions"]),
        ]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::OwnershipOverlap);
    }

    #[test]
    fn opposite_tension_sides_are_flagged() {
        let conflicts = run(&[
            decision("ARCH-001", "Backend handlers are stateless.", &["architecture"]),
            decision("AUTH-001", "Use sticky sessions at the load balancer.", &["architecture"]),
        ]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::ImplementationTension);
    }

    #[test]
    fn missing_capability_is_a_dependency_gap() {
        let conflicts = run(&[
            decision("JOBS-001", "The scheduler relies on idempotent retries.", &["jobs"]),
            decision("QUEU-001", "The queue does not provide idempotent retries.", &["jobs"]),
        ]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::ImplicitDependencyGap);
        assert_eq!(conflicts[0].decisions.len(), 2);
    }

    #[test]
    fn requirement_nobody_provides_is_a_single_decision_gap() {
        let conflicts = run(&[decision("JOBS-001", "The scheduler assumes a distributed lock.", &["jobs"])]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].decisions.len(), 1);

        let satisfied = run(&[
            decision("JOBS-001", "The scheduler assumes a distributed lock.", &["jobs"]),
            decision("INFR-001", "Redis provides a distributed lock.", &["infrastructure"]),
        ]);
        assert!(satisfied.is_empty(), "{satisfied:?}");
    }

    proptest! {
        #[test]
        fn detection_ignores_insertion_order(shuffled in Just(vec![
            decision("AUTH-001", "Store session tokens in localStorage.", &["authentication"]),
            decision("SECU-001", "Keep session tokens in httpOnly cookies.", &["authentication"]),
            decision("PERF-001", "Login latency must stay under 100ms.", &["authentication"]),
            decision("IDPX-001", "The identity provider needs login latency of at least 1s.", &["authentication"]),
            decision("AUTH-002", "The auth service owns token refresh.", &["authentication", "tokens"]),
            decision("GATE-001", "The gateway owns token refresh.", &["tokens"]),
        ]).prop_shuffle()) {
            let mut sorted = shuffled.clone();
            sorted.sort_by(|a, b| a.id.cmp(&b.id));
            prop_assert_eq!(run(&shuffled), run(&sorted));
            prop_assert_eq!(run(&shuffled).len(), 3);
        }
    }
}
