//! Decision store and deconfliction engine.
//!
//! Decisions arrive from external planning producers as structured records.
//! Each producer owns one 4-letter tag and numbers its decisions
//! monotonically under it. Decisions are never overwritten: amending appends
//! a revision, and a decision that `amends` another supersedes it.
//!
//! Before tasks are generated, [`DecisionStore::ensure_deconflicted`] clusters
//! the active decisions by concern area, runs the rule-driven pairwise scan in
//! [`conflicts`] and refuses to proceed while any detected conflict lacks a
//! recorded human resolution.

pub mod conflicts;
pub mod rules;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use foreman_common::DecisionId;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::chain::{self, ChainRecord, stage};
use crate::errors::{ContractError, InvariantViolation, Result};
use crate::session;
use crate::store::{self, StoreHandle};
pub use conflicts::{Conflict, ConflictKind};
pub use rules::{DeconflictionConfig, RuleSet};

const ACTOR: &str = "decision-store";

/// Concern tag -> ids of the active decisions carrying it.
pub type ConcernIndex = BTreeMap<String, Vec<DecisionId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Draft,
    Confirmed,
    Amended,
    Superseded,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Confirmed => "confirmed",
            Self::Amended => "amended",
            Self::Superseded => "superseded",
        }
    }

    /// Confirmed or amended: usable as a task's decision reference.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Amended)
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "confirmed" => Ok(Self::Confirmed),
            "amended" => Ok(Self::Amended),
            "superseded" => Ok(Self::Superseded),
            _ => anyhow::bail!(
                "Invalid decision status '{}'. Valid values: draft, confirmed, amended, superseded",
                s
            ),
        }
    }
}

/// Current view of a decision (its latest revision).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub id: DecisionId,
    pub producer: String,
    pub text: String,
    pub status: DecisionStatus,
    pub concern_areas: BTreeSet<String>,
    pub revision: u32,
    pub amends: Option<DecisionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRevision {
    pub decision_id: DecisionId,
    pub revision: u32,
    pub text: String,
    pub concern_areas: BTreeSet<String>,
    pub status: DecisionStatus,
    pub created_at: DateTime<Utc>,
}

/// A structured record from a planning producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionInput {
    /// Allocated from the producer's tag when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<DecisionId>,
    pub producer: String,
    pub text: String,
    #[serde(default)]
    pub concern_areas: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DecisionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amends: Option<DecisionId>,
}

impl DecisionInput {
    pub fn new<S: Into<String>>(
        producer: impl Into<String>,
        text: impl Into<String>,
        concern_areas: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            id: None,
            producer: producer.into(),
            text: text.into(),
            concern_areas: concern_areas.into_iter().map(Into::into).collect(),
            status: None,
            amends: None,
        }
    }

    pub fn with_id(mut self, id: DecisionId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_status(mut self, status: DecisionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn amending(mut self, id: DecisionId) -> Self {
        self.amends = Some(id);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionKind {
    Accepted,
    Amended,
    Superseded,
}

impl ResolutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Amended => "amended",
            Self::Superseded => "superseded",
        }
    }
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "accepted" | "accept" => Ok(Self::Accepted),
            "amended" | "amend" => Ok(Self::Amended),
            "superseded" | "supersede" => Ok(Self::Superseded),
            _ => anyhow::bail!(
                "Invalid resolution '{}'. Valid values: accepted, amended, superseded",
                s
            ),
        }
    }
}

/// What the operator does about a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionAction {
    /// Keep both decisions; not allowed for direct contradictions.
    Accept { rationale: String },
    /// Amend one participant with new text.
    Amend {
        decision: DecisionId,
        text: String,
        rationale: String,
    },
    /// Retire one participant.
    Supersede { decision: DecisionId, rationale: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: String,
    pub kind: ConflictKind,
    pub decisions: Vec<DecisionId>,
    pub resolution: ResolutionKind,
    pub decision: Option<DecisionId>,
    pub rationale: String,
    pub resolved_at: DateTime<Utc>,
}

/// Result of one deconfliction pass.
#[derive(Debug, Clone, Serialize)]
pub struct DeconflictionReport {
    pub index: ConcernIndex,
    pub conflicts: Vec<Conflict>,
    pub unresolved: Vec<Conflict>,
}

impl DeconflictionReport {
    pub fn is_clear(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Build the concern index over every non-superseded decision.
pub fn build_index<'a>(decisions: impl IntoIterator<Item = &'a Decision>) -> ConcernIndex {
    let mut index = ConcernIndex::new();
    for decision in decisions {
        if decision.status == DecisionStatus::Superseded {
            continue;
        }
        for tag in &decision.concern_areas {
            index.entry(tag.clone()).or_default().push(decision.id.clone());
        }
    }
    for ids in index.values_mut() {
        ids.sort();
        ids.dedup();
    }
    index
}

fn normalize_concerns(raw: &[String]) -> BTreeSet<String> {
    raw.iter()
        .map(|tag| tag.trim().to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// First four ASCII letters of the producer name, upper-cased.
fn derive_tag(producer: &str) -> Result<String> {
    let tag: String = producer
        .chars()
        .filter(char::is_ascii_alphabetic)
        .take(4)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if tag.len() == 4 {
        Ok(tag)
    } else {
        Err(ContractError::Invalid(format!(
            "Cannot derive a 4-letter tag from producer '{}'; supply an explicit id",
            producer
        ))
        .into())
    }
}

fn get_in(conn: &Connection, id: &DecisionId) -> Result<Decision> {
    store::decisions::get(conn, id)?.ok_or_else(|| ContractError::UnknownDecision(id.clone()).into())
}

fn add_in(conn: &Connection, input: &DecisionInput) -> Result<Decision> {
    let text = input.text.trim();
    if text.is_empty() {
        return Err(ContractError::EmptyDecisionText.into());
    }
    let producer = input.producer.trim();
    if producer.is_empty() {
        return Err(ContractError::Invalid("Decision producer must not be empty".to_string()).into());
    }

    let established = store::decisions::producer_tag(conn, producer)?;
    let id = match &input.id {
        Some(id) => {
            if let Some(expected) = &established {
                if id.tag() != expected {
                    return Err(ContractError::ProducerTagMismatch {
                        producer: producer.to_string(),
                        expected: expected.clone(),
                        id: id.clone(),
                    }
                    .into());
                }
            }
            id.clone()
        }
        None => {
            let tag = match established {
                Some(tag) => tag,
                None => derive_tag(producer)?,
            };
            DecisionId::new(&tag, store::decisions::last_ordinal(conn, &tag)? + 1)?
        }
    };

    let concern_areas = normalize_concerns(&input.concern_areas);
    if concern_areas.is_empty() {
        return Err(ContractError::NoConcernAreas { id: id.to_string() }.into());
    }
    if let Some(owner) = store::decisions::tag_owner(conn, id.tag())? {
        if owner != producer {
            return Err(ContractError::TagOwnedByOtherProducer {
                tag: id.tag().to_string(),
                owner,
            }
            .into());
        }
    }
    let last = store::decisions::last_ordinal(conn, id.tag())?;
    if id.ordinal() <= last {
        return Err(ContractError::NonMonotonicDecisionId {
            tag: id.tag().to_string(),
            id,
            last,
        }
        .into());
    }

    let status = input.status.unwrap_or(DecisionStatus::Draft);
    if !matches!(status, DecisionStatus::Draft | DecisionStatus::Confirmed) {
        return Err(ContractError::Invalid(format!(
            "New decisions must be draft or confirmed, not {}",
            status
        ))
        .into());
    }

    if let Some(target) = &input.amends {
        supersede_in(conn, target, id.as_str())?;
    }

    let now = Utc::now();
    let decision = Decision {
        id,
        producer: producer.to_string(),
        text: text.to_string(),
        status,
        concern_areas,
        revision: 1,
        amends: input.amends.clone(),
        created_at: now,
        updated_at: now,
    };
    store::decisions::insert(conn, &decision)?;
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::DECISION_ADD)
            .input(input)
            .output(&decision)
            .verdict(decision.status.as_str()),
    )?;
    tracing::info!(id = %decision.id, producer = %decision.producer, "decision added");
    Ok(decision)
}

/// Retire `target`; `cause` names what replaced it (a decision or conflict id).
fn supersede_in(conn: &Connection, target: &DecisionId, cause: &str) -> Result<Decision> {
    let prior = get_in(conn, target)?;
    if prior.status == DecisionStatus::Superseded {
        return Err(InvariantViolation::DecisionSuperseded { id: prior.id }.into());
    }
    let now = Utc::now();
    store::decisions::update_head(conn, target, DecisionStatus::Superseded, prior.revision, &now)?;
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::DECISION_SUPERSEDE)
            .input(cause)
            .output(&prior)
            .verdict(DecisionStatus::Superseded.as_str()),
    )?;
    tracing::info!(id = %target, cause, "decision superseded");
    Ok(get_in(conn, target)?)
}

fn amend_in(
    conn: &Connection,
    id: &DecisionId,
    text: &str,
    concern_areas: Option<&[String]>,
) -> Result<Decision> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ContractError::EmptyDecisionText.into());
    }
    let current = get_in(conn, id)?;
    if current.status == DecisionStatus::Superseded {
        return Err(InvariantViolation::DecisionSuperseded { id: current.id }.into());
    }
    let concern_areas = match concern_areas {
        Some(raw) => {
            let normalized = normalize_concerns(raw);
            if normalized.is_empty() {
                return Err(ContractError::NoConcernAreas { id: id.to_string() }.into());
            }
            normalized
        }
        None => current.concern_areas.clone(),
    };
    // Amending a draft keeps it a draft; it still needs confirmation.
    let status = match current.status {
        DecisionStatus::Draft => DecisionStatus::Draft,
        _ => DecisionStatus::Amended,
    };

    let now = Utc::now();
    let revision = DecisionRevision {
        decision_id: id.clone(),
        revision: current.revision + 1,
        text: text.to_string(),
        concern_areas,
        status,
        created_at: now,
    };
    store::decisions::insert_revision(conn, &revision)?;
    store::decisions::update_head(conn, id, status, revision.revision, &now)?;
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::DECISION_AMEND)
            .input(&current)
            .output(&revision)
            .verdict(status.as_str()),
    )?;
    tracing::info!(id = %id, revision = revision.revision, "decision amended");
    get_in(conn, id)
}

fn report_in(conn: &Connection, rules: &RuleSet) -> Result<DeconflictionReport> {
    let decisions = store::decisions::list(conn)?;
    let index = build_index(&decisions);
    let by_id: BTreeMap<DecisionId, Decision> =
        decisions.into_iter().map(|d| (d.id.clone(), d)).collect();
    let conflicts = conflicts::detect(&index, &by_id, rules);
    let resolved = store::decisions::resolved_ids(conn)?;
    let unresolved = conflicts
        .iter()
        .filter(|c| !resolved.contains(&c.id))
        .cloned()
        .collect();
    Ok(DeconflictionReport {
        index,
        conflicts,
        unresolved,
    })
}

/// Handle over the decision tables.
#[derive(Clone)]
pub struct DecisionStore {
    store: StoreHandle,
    rules: Arc<RuleSet>,
}

impl DecisionStore {
    pub fn new(store: StoreHandle, rules: RuleSet) -> Self {
        Self {
            store,
            rules: Arc::new(rules),
        }
    }

    /// Build the rule set from `[deconfliction]` settings.
    pub fn with_config(store: StoreHandle, config: &DeconflictionConfig) -> Result<Self> {
        let rules = RuleSet::from_config(config)
            .map_err(|e| ContractError::Invalid(format!("Invalid deconfliction rule: {}", e)))?;
        Ok(Self::new(store, rules))
    }

    /// Validate and store one decision record.
    pub fn add_decision(&self, input: DecisionInput) -> Result<Decision> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let decision = add_in(&tx, &input)?;
        tx.commit()?;
        Ok(decision)
    }

    /// Store a batch of records atomically; any invalid record rejects all.
    pub fn import(&self, inputs: &[DecisionInput]) -> Result<Vec<Decision>> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let mut added = Vec::with_capacity(inputs.len());
        for input in inputs {
            added.push(add_in(&tx, input)?);
        }
        tx.commit()?;
        Ok(added)
    }

    pub fn confirm(&self, id: &DecisionId) -> Result<Decision> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let current = get_in(&tx, id)?;
        match current.status {
            DecisionStatus::Draft => {}
            DecisionStatus::Superseded => {
                return Err(InvariantViolation::DecisionSuperseded { id: id.clone() }.into());
            }
            DecisionStatus::Confirmed | DecisionStatus::Amended => {
                return Err(InvariantViolation::DecisionAlreadyConfirmed { id: id.clone() }.into());
            }
        }
        store::decisions::update_head(&tx, id, DecisionStatus::Confirmed, current.revision, &Utc::now())?;
        let confirmed = get_in(&tx, id)?;
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::DECISION_CONFIRM)
                .input(&current)
                .output(&confirmed)
                .verdict(DecisionStatus::Confirmed.as_str()),
        )?;
        tx.commit()?;
        Ok(confirmed)
    }

    /// Append a new revision. The id is retained.
    pub fn amend(
        &self,
        id: &DecisionId,
        text: &str,
        concern_areas: Option<&[String]>,
    ) -> Result<Decision> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let decision = amend_in(&tx, id, text, concern_areas)?;
        tx.commit()?;
        Ok(decision)
    }

    pub fn get(&self, id: &DecisionId) -> Result<Decision> {
        let guard = self.store.lock_sync()?;
        get_in(guard.conn(), id)
    }

    pub fn list(&self) -> Result<Vec<Decision>> {
        let guard = self.store.lock_sync()?;
        Ok(store::decisions::list(guard.conn())?)
    }

    /// Every revision of `id`, oldest first.
    pub fn history(&self, id: &DecisionId) -> Result<Vec<DecisionRevision>> {
        let guard = self.store.lock_sync()?;
        get_in(guard.conn(), id)?;
        Ok(store::decisions::history(guard.conn(), id)?)
    }

    pub fn build_concern_index(&self) -> Result<ConcernIndex> {
        Ok(build_index(&self.list()?))
    }

    /// Candidate conflicts among the decisions named by `index`.
    pub fn detect_conflicts(&self, index: &ConcernIndex) -> Result<Vec<Conflict>> {
        let by_id: BTreeMap<DecisionId, Decision> =
            self.list()?.into_iter().map(|d| (d.id.clone(), d)).collect();
        Ok(conflicts::detect(index, &by_id, &self.rules))
    }

    /// Index, conflicts and which of them still lack a resolution.
    pub fn report(&self) -> Result<DeconflictionReport> {
        let guard = self.store.lock_sync()?;
        report_in(guard.conn(), &self.rules)
    }

    pub fn resolutions(&self) -> Result<Vec<ConflictResolution>> {
        let guard = self.store.lock_sync()?;
        Ok(store::decisions::list_resolutions(guard.conn())?)
    }

    /// Record a human resolution for a currently detected conflict.
    ///
    /// `Amend` and `Supersede` apply the change to the named participant in
    /// the same transaction. If the amended pair still conflicts, the new
    /// fingerprint shows up unresolved on the next pass.
    pub fn resolve_conflict(&self, conflict_id: &str, action: ResolutionAction) -> Result<ConflictResolution> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let report = report_in(&tx, &self.rules)?;
        let conflict = report
            .conflicts
            .iter()
            .find(|c| c.id == conflict_id)
            .cloned()
            .ok_or_else(|| ContractError::UnknownConflict(conflict_id.to_string()))?;
        if !report.unresolved.iter().any(|c| c.id == conflict.id) {
            return Err(ContractError::Invalid(format!("Conflict {} is already resolved", conflict.id)).into());
        }

        let ensure_participant = |decision: &DecisionId| -> Result<()> {
            if conflict.decisions.contains(decision) {
                Ok(())
            } else {
                Err(ContractError::ResolutionOutsideConflict {
                    conflict: conflict.id.clone(),
                    decision: decision.clone(),
                }
                .into())
            }
        };

        let (resolution, decision, rationale) = match action {
            ResolutionAction::Accept { rationale } => {
                if conflict.kind == ConflictKind::DirectContradiction {
                    return Err(ContractError::ContradictionNeedsChange {
                        id: conflict.id.clone(),
                    }
                    .into());
                }
                if rationale.trim().is_empty() {
                    return Err(ContractError::Invalid(
                        "Accepting a conflict requires a rationale".to_string(),
                    )
                    .into());
                }
                (ResolutionKind::Accepted, None, rationale)
            }
            ResolutionAction::Amend {
                decision,
                text,
                rationale,
            } => {
                ensure_participant(&decision)?;
                amend_in(&tx, &decision, &text, None)?;
                (ResolutionKind::Amended, Some(decision), rationale)
            }
            ResolutionAction::Supersede { decision, rationale } => {
                ensure_participant(&decision)?;
                supersede_in(&tx, &decision, &conflict.id)?;
                (ResolutionKind::Superseded, Some(decision), rationale)
            }
        };

        let record = ConflictResolution {
            conflict_id: conflict.id.clone(),
            kind: conflict.kind,
            decisions: conflict.decisions.clone(),
            resolution,
            decision,
            rationale,
            resolved_at: Utc::now(),
        };
        store::decisions::insert_resolution(&tx, &record)?;
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::CONFLICT_RESOLVE)
                .input(&conflict)
                .output(&record)
                .verdict(resolution.as_str()),
        )?;
        tx.commit()?;
        tracing::info!(conflict = %record.conflict_id, resolution = %resolution, "conflict resolved");
        Ok(record)
    }

    /// The hard gate in front of task generation.
    ///
    /// Unresolved conflicts raise the session's awaiting-input flag (which is
    /// committed) and are returned as an invariant violation.
    pub fn ensure_deconflicted(&self) -> Result<DeconflictionReport> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let report = report_in(&tx, &self.rules)?;
        let ids: Vec<&str> = report.conflicts.iter().map(|c| c.id.as_str()).collect();
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::CONFLICT_DETECT)
                .input(&report.index)
                .output(&ids)
                .verdict(if report.is_clear() { "clear" } else { "blocked" }),
        )?;

        if report.is_clear() {
            tx.commit()?;
            return Ok(report);
        }

        for conflict in &report.unresolved {
            tracing::warn!(conflict = %conflict, "unresolved decision conflict");
        }
        session::raise_in(
            &tx,
            &format!("{} unresolved decision conflict(s)", report.unresolved.len()),
        )?;
        tx.commit()?;
        Err(InvariantViolation::UnresolvedConflicts {
            conflicts: report.unresolved,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::AuditChain;
    use crate::errors::CoreError;
    use crate::session::Session;

    fn setup() -> (StoreHandle, DecisionStore) {
        let handle = StoreHandle::in_memory().unwrap();
        let store = DecisionStore::new(handle.clone(), RuleSet::builtin().unwrap());
        (handle, store)
    }

    fn id(s: &str) -> DecisionId {
        s.parse().unwrap()
    }

    fn seed_contradiction(store: &DecisionStore) {
        store
            .add_decision(
                DecisionInput::new("auth", "Store session tokens in localStorage.", ["Authentication"])
                    .with_status(DecisionStatus::Confirmed),
            )
            .unwrap();
        store
            .add_decision(
                DecisionInput::new("security", "Keep session tokens in httpOnly cookies.", ["authentication"])
                    .with_status(DecisionStatus::Confirmed),
            )
            .unwrap();
    }

    #[test]
    fn ids_are_allocated_per_producer_tag() {
        let (_, store) = setup();
        let first = store.add_decision(DecisionInput::new("auth", "Use OIDC.", ["authentication"])).unwrap();
        let second = store.add_decision(DecisionInput::new("auth", "Rotate keys daily.", ["keys"])).unwrap();
        let other = store
            .add_decision(DecisionInput::new("data-modeler", "UUID primary keys.", ["data"]))
            .unwrap();
        assert_eq!(first.id.as_str(), "AUTH-001");
        assert_eq!(second.id.as_str(), "AUTH-002");
        assert_eq!(other.id.as_str(), "DATA-001");
        assert_eq!(first.status, DecisionStatus::Draft);
    }

    #[test]
    fn explicit_ids_must_match_tag_and_increase() {
        let (_, store) = setup();
        store
            .add_decision(DecisionInput::new("auth", "Use OIDC.", ["authentication"]).with_id(id("AUTH-005")))
            .unwrap();

        let err = store
            .add_decision(DecisionInput::new("auth", "x", ["a"]).with_id(id("SECU-001")))
            .unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::ProducerTagMismatch { .. })));

        let err = store
            .add_decision(DecisionInput::new("auth", "x", ["a"]).with_id(id("AUTH-003")))
            .unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::NonMonotonicDecisionId { last: 5, .. })));

        let err = store
            .add_decision(DecisionInput::new("authority", "x", ["a"]).with_id(id("AUTH-009")))
            .unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::TagOwnedByOtherProducer { .. })));
    }

    #[test]
    fn malformed_records_are_rejected_without_side_effects() {
        let (handle, store) = setup();
        let err = store.add_decision(DecisionInput::new("auth", "   ", ["a"])).unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::EmptyDecisionText)));
        let err = store
            .add_decision(DecisionInput::new("auth", "Use OIDC.", [" ", ""]))
            .unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::NoConcernAreas { .. })));

        assert!(store.list().unwrap().is_empty());
        assert!(AuditChain::new(handle).is_empty().unwrap());
    }

    #[test]
    fn import_is_all_or_nothing() {
        let (_, store) = setup();
        let inputs = vec![
            DecisionInput::new("auth", "Use OIDC.", ["authentication"]),
            DecisionInput::new("auth", "", ["authentication"]),
        ];
        assert!(store.import(&inputs).is_err());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn amend_appends_a_revision_and_keeps_the_id() {
        let (_, store) = setup();
        let original = store
            .add_decision(
                DecisionInput::new("auth", "Sessions last 30 days.", ["sessions"])
                    .with_status(DecisionStatus::Confirmed),
            )
            .unwrap();
        let amended = store.amend(&original.id, "Sessions last 7 days.", None).unwrap();
        assert_eq!(amended.id, original.id);
        assert_eq!(amended.revision, 2);
        assert_eq!(amended.status, DecisionStatus::Amended);

        let history = store.history(&original.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text, "Sessions last 30 days.");
        assert_eq!(history[1].text, "Sessions last 7 days.");
    }

    #[test]
    fn amends_reference_supersedes_the_prior_decision() {
        let (_, store) = setup();
        let prior = store.add_decision(DecisionInput::new("auth", "Use JWT.", ["tokens"])).unwrap();
        store
            .add_decision(DecisionInput::new("auth", "Use opaque tokens.", ["tokens"]).amending(prior.id.clone()))
            .unwrap();
        assert_eq!(store.get(&prior.id).unwrap().status, DecisionStatus::Superseded);

        let err = store.amend(&prior.id, "Use PASETO.", None).unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantViolation::DecisionSuperseded { .. })));
        let err = store.confirm(&prior.id).unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantViolation::DecisionSuperseded { .. })));

        let index = store.build_concern_index().unwrap();
        assert_eq!(index["tokens"], vec![id("AUTH-002")]);
    }

    #[test]
    fn confirm_is_a_one_way_gate() {
        let (_, store) = setup();
        let draft = store.add_decision(DecisionInput::new("auth", "Use OIDC.", ["authentication"])).unwrap();
        assert_eq!(store.confirm(&draft.id).unwrap().status, DecisionStatus::Confirmed);
        let err = store.confirm(&draft.id).unwrap_err();
        assert!(matches!(err, CoreError::Invariant(InvariantViolation::DecisionAlreadyConfirmed { .. })));
    }

    #[test]
    fn concern_tags_are_normalized() {
        let (_, store) = setup();
        seed_contradiction(&store);
        let index = store.build_concern_index().unwrap();
        assert_eq!(index.keys().collect::<Vec<_>>(), vec!["authentication"]);
        assert_eq!(index["authentication"].len(), 2);
    }

    #[test]
    fn unresolved_contradiction_blocks_and_raises_awaiting_input() {
        let (handle, store) = setup();
        seed_contradiction(&store);

        let err = store.ensure_deconflicted().unwrap_err();
        match err {
            CoreError::Invariant(InvariantViolation::UnresolvedConflicts { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].kind, ConflictKind::DirectContradiction);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(Session::new(handle).awaiting().unwrap().is_some());
    }

    #[test]
    fn contradictions_cannot_simply_be_accepted() {
        let (_, store) = setup();
        seed_contradiction(&store);
        let conflict = store.report().unwrap().unresolved[0].clone();
        let err = store
            .resolve_conflict(&conflict.id, ResolutionAction::Accept { rationale: "fine".into() })
            .unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::ContradictionNeedsChange { .. })));
    }

    #[test]
    fn superseding_one_side_clears_the_gate() {
        let (handle, store) = setup();
        seed_contradiction(&store);
        let conflict = store.report().unwrap().unresolved[0].clone();

        let err = store
            .resolve_conflict(
                &conflict.id,
                ResolutionAction::Supersede {
                    decision: id("DATA-001"),
                    rationale: "wrong one".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::ResolutionOutsideConflict { .. })));

        let resolution = store
            .resolve_conflict(
                &conflict.id,
                ResolutionAction::Supersede {
                    decision: id("AUTH-001"),
                    rationale: "cookies are the security baseline".into(),
                },
            )
            .unwrap();
        assert_eq!(resolution.resolution, ResolutionKind::Superseded);
        assert!(store.ensure_deconflicted().unwrap().is_clear());
        assert!(AuditChain::new(handle).verify().unwrap().valid);
    }

    #[test]
    fn amending_away_the_contradiction_clears_the_gate() {
        let (_, store) = setup();
        seed_contradiction(&store);
        let conflict = store.report().unwrap().unresolved[0].clone();
        store
            .resolve_conflict(
                &conflict.id,
                ResolutionAction::Amend {
                    decision: id("AUTH-001"),
                    text: "Store session tokens in httpOnly cookies.".into(),
                    rationale: "align with security".into(),
                },
            )
            .unwrap();
        let report = store.ensure_deconflicted().unwrap();
        assert!(report.conflicts.is_empty());
        assert_eq!(store.get(&id("AUTH-001")).unwrap().revision, 2);
    }

    #[test]
    fn accepted_tension_stays_resolved() {
        let (_, store) = setup();
        store
            .add_decision(DecisionInput::new("arch", "Backend handlers are stateless.", ["architecture"]))
            .unwrap();
        store
            .add_decision(DecisionInput::new("operations", "Use sticky sessions at the load balancer.", ["architecture"]))
            .unwrap();
        let conflict = store.report().unwrap().unresolved[0].clone();
        assert_eq!(conflict.kind, ConflictKind::ImplementationTension);

        store
            .resolve_conflict(&conflict.id, ResolutionAction::Accept { rationale: "websocket affinity only".into() })
            .unwrap();
        let report = store.ensure_deconflicted().unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert!(report.is_clear());
        assert_eq!(store.resolutions().unwrap().len(), 1);
    }
}
