//! Session-level `AwaitingInput` flag.
//!
//! Escalations pause the session instead of adding states to tasks or
//! milestones. While the flag is raised no new task may be started; an
//! operator clears it with [`Session::resume`].

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::chain::{self, ChainRecord, stage};
use crate::errors::{ContractError, Result};
use crate::store::{self, StoreHandle};

const AWAITING_KEY: &str = "awaiting_input";
const ACTOR: &str = "session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitingInput {
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

/// The pending pause, if any.
pub fn awaiting_in(conn: &Connection) -> Result<Option<AwaitingInput>> {
    match store::session::get(conn, AWAITING_KEY)? {
        Some(raw) => Ok(Some(store::from_json("session", &raw)?)),
        None => Ok(None),
    }
}

/// Raise the flag (or add `reason` to an already raised one) and mirror it
/// to the chain.
pub fn raise_in(conn: &Connection, reason: &str) -> Result<AwaitingInput> {
    let awaiting = match awaiting_in(conn)? {
        Some(existing) if existing.reason.contains(reason) => return Ok(existing),
        Some(existing) => AwaitingInput {
            reason: format!("{}; {}", existing.reason, reason),
            raised_at: existing.raised_at,
        },
        None => AwaitingInput {
            reason: reason.to_string(),
            raised_at: Utc::now(),
        },
    };
    store::session::set(conn, AWAITING_KEY, &store::to_json(&awaiting)?)?;
    chain::append_in(
        conn,
        ChainRecord::new(ACTOR, stage::SESSION_AWAIT)
            .input(reason)
            .output(&awaiting),
    )?;
    tracing::warn!(reason = %awaiting.reason, "session awaiting operator input");
    Ok(awaiting)
}

/// Refuse with `AwaitingInput` while the flag is raised.
pub fn ensure_not_awaiting_in(conn: &Connection) -> Result<()> {
    match awaiting_in(conn)? {
        Some(awaiting) => Err(ContractError::AwaitingInput {
            reason: awaiting.reason,
        }
        .into()),
        None => Ok(()),
    }
}

#[derive(Clone)]
pub struct Session {
    store: StoreHandle,
}

impl Session {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    pub fn awaiting(&self) -> Result<Option<AwaitingInput>> {
        let guard = self.store.lock_sync()?;
        awaiting_in(guard.conn())
    }

    pub fn raise(&self, reason: &str) -> Result<AwaitingInput> {
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let awaiting = raise_in(&tx, reason)?;
        tx.commit()?;
        Ok(awaiting)
    }

    /// Clear the flag, recording the operator's note on the chain.
    pub fn resume(&self, note: &str) -> Result<AwaitingInput> {
        if note.trim().is_empty() {
            return Err(ContractError::Invalid("A resume note is required".to_string()).into());
        }
        let mut guard = self.store.lock_sync()?;
        let tx = guard.transaction()?;
        let Some(cleared) = awaiting_in(&tx)? else {
            return Err(ContractError::Invalid("Session is not awaiting input".to_string()).into());
        };
        store::session::delete(&tx, AWAITING_KEY)?;
        chain::append_in(
            &tx,
            ChainRecord::new(ACTOR, stage::SESSION_RESUME)
                .input(note)
                .output(&cleared),
        )?;
        tx.commit()?;
        tracing::info!(reason = %cleared.reason, "session resumed");
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::AuditChain;
    use crate::errors::CoreError;

    #[test]
    fn raise_then_resume_round_trip() {
        let handle = StoreHandle::in_memory().unwrap();
        let session = Session::new(handle.clone());
        assert!(session.awaiting().unwrap().is_none());

        session.raise("T03 hit the review ceiling").unwrap();
        let awaiting = session.awaiting().unwrap().unwrap();
        assert!(awaiting.reason.contains("T03"));

        session.resume("split T03 into two tasks").unwrap();
        assert!(session.awaiting().unwrap().is_none());

        let stages: Vec<String> = AuditChain::new(handle)
            .entries(None)
            .unwrap()
            .into_iter()
            .map(|e| e.stage)
            .collect();
        assert_eq!(stages, vec![stage::SESSION_AWAIT, stage::SESSION_RESUME]);
    }

    #[test]
    fn raising_twice_accumulates_reasons() {
        let session = Session::new(StoreHandle::in_memory().unwrap());
        session.raise("milestone M1 blocked").unwrap();
        session.raise("T05 escalated").unwrap();
        let awaiting = session.awaiting().unwrap().unwrap();
        assert_eq!(awaiting.reason, "milestone M1 blocked; T05 escalated");
    }

    #[test]
    fn resume_without_pause_is_rejected() {
        let session = Session::new(StoreHandle::in_memory().unwrap());
        let err = session.resume("nothing to do").unwrap_err();
        assert!(matches!(err, CoreError::Contract(ContractError::Invalid(_))));
    }

    #[test]
    fn ensure_not_awaiting_reports_the_reason() {
        let handle = StoreHandle::in_memory().unwrap();
        Session::new(handle.clone()).raise("conflicts unresolved").unwrap();
        let guard = handle.lock_sync().unwrap();
        let err = ensure_not_awaiting_in(guard.conn()).unwrap_err();
        assert!(err.to_string().contains("conflicts unresolved"));
    }
}
