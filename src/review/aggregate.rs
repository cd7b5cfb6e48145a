//! Fold reviewer records into one verdict.

use foreman_common::{AggregateKind, ReviewSubject};

use super::{AggregateVerdict, ReviewGap, ReviewRecord};

/// Any block wins, then any concern, else pass.
///
/// Unavailable records never count as a block; they are added to `gaps`.
/// A PASS with any gap is lowered to CONCERN so the gap is surfaced.
pub fn aggregate(
    subject: ReviewSubject,
    cycle: u32,
    records: Vec<ReviewRecord>,
    mut gaps: Vec<ReviewGap>,
) -> AggregateVerdict {
    for record in records.iter().filter(|r| !r.verdict.is_available()) {
        if !gaps.iter().any(|g| g.reviewer == record.reviewer_id) {
            gaps.push(ReviewGap::unavailable(record.reviewer_id.clone()));
        }
    }

    let raw = AggregateKind::from_verdicts(records.iter().map(|r| &r.verdict));
    let degraded = raw == AggregateKind::Pass && !gaps.is_empty();
    let kind = if degraded { AggregateKind::Concern } else { raw };
    let findings = records
        .iter()
        .filter(|r| r.verdict.is_available())
        .flat_map(|r| r.findings.iter().cloned())
        .collect();

    AggregateVerdict {
        subject,
        cycle,
        kind,
        degraded,
        records,
        gaps,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_common::{Finding, ReviewVerdict, TaskId};
    use proptest::prelude::*;

    fn record(reviewer: &str, verdict: ReviewVerdict) -> ReviewRecord {
        ReviewRecord {
            subject: ReviewSubject::Task(TaskId::new(1)),
            cycle: 1,
            reviewer_id: reviewer.to_string(),
            verdict,
            findings: match verdict {
                ReviewVerdict::Pass | ReviewVerdict::Unavailable => Vec::new(),
                _ => vec![Finding::new(format!("{reviewer}: {verdict}"))],
            },
            chain_seq: 1,
            created_at: Utc::now(),
        }
    }

    fn subject() -> ReviewSubject {
        ReviewSubject::Task(TaskId::new(1))
    }

    #[test]
    fn one_block_blocks_the_cycle() {
        let verdict = aggregate(
            subject(),
            1,
            vec![record("a", ReviewVerdict::Block), record("b", ReviewVerdict::Pass)],
            Vec::new(),
        );
        assert_eq!(verdict.kind, AggregateKind::Block);
        assert_eq!(verdict.findings.len(), 1);
        assert!(!verdict.degraded);
    }

    #[test]
    fn concern_without_block_is_concern() {
        let verdict = aggregate(
            subject(),
            1,
            vec![record("a", ReviewVerdict::Concern), record("b", ReviewVerdict::Pass)],
            Vec::new(),
        );
        assert_eq!(verdict.kind, AggregateKind::Concern);
    }

    #[test]
    fn unavailable_reviewer_degrades_pass_to_concern() {
        let verdict = aggregate(
            subject(),
            1,
            vec![record("a", ReviewVerdict::Pass), record("sec", ReviewVerdict::Unavailable)],
            Vec::new(),
        );
        assert_eq!(verdict.kind, AggregateKind::Concern);
        assert!(verdict.degraded);
        assert_eq!(verdict.gap_names(), vec!["sec".to_string()]);
        assert!(verdict.has_verdicts());
    }

    #[test]
    fn unavailable_never_blocks() {
        let verdict = aggregate(subject(), 1, vec![record("a", ReviewVerdict::Unavailable)], Vec::new());
        assert_ne!(verdict.kind, AggregateKind::Block);
        assert!(!verdict.has_verdicts());
    }

    #[test]
    fn gaps_are_not_duplicated() {
        let verdict = aggregate(
            subject(),
            1,
            vec![record("sec", ReviewVerdict::Unavailable)],
            vec![ReviewGap::missing("sec")],
        );
        assert_eq!(verdict.gaps.len(), 1);
    }

    fn any_verdict() -> impl Strategy<Value = ReviewVerdict> {
        prop_oneof![
            Just(ReviewVerdict::Pass),
            Just(ReviewVerdict::Concern),
            Just(ReviewVerdict::Block),
            Just(ReviewVerdict::Unavailable),
        ]
    }

    proptest! {
        #[test]
        fn aggregate_ignores_record_order(verdicts in prop::collection::vec(any_verdict(), 1..8)) {
            let records: Vec<_> = verdicts
                .iter()
                .enumerate()
                .map(|(i, v)| record(&format!("r{i}"), *v))
                .collect();
            let mut reversed = records.clone();
            reversed.reverse();

            let forward = aggregate(subject(), 1, records, Vec::new());
            let backward = aggregate(subject(), 1, reversed, Vec::new());
            prop_assert_eq!(forward.kind, backward.kind);
            prop_assert_eq!(forward.kind == AggregateKind::Block, verdicts.contains(&ReviewVerdict::Block));
        }
    }
}
