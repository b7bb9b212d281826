use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::board::BoardState;
use crate::model::record::RecordId;
use crate::model::work_unit::WorkUnit;

use super::engine::{derive_stage, Stage};

/// One unit awaiting review, with everything its position in the queue is
/// computed from.
#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub id: RecordId,
    pub title: String,
    /// Days since the board task last changed, plus the configured corrective
    /// offset for this unit.
    pub latency_days: i64,
    pub unresolved_blockers: usize,
    /// Days since the oldest still-unresolved discussion thread was opened.
    pub oldest_discussion_days: Option<i64>,
}

/// Collect the review queue: units in the review stage that have a matched
/// board task (latency is measured from the board, so an unmatched unit has
/// no queue position yet).
pub fn review_items(
    units: &[WorkUnit],
    board: &BoardState,
    offsets: &HashMap<RecordId, i64>,
    now: DateTime<Utc>,
) -> Vec<ReviewItem> {
    units
        .iter()
        .filter(|unit| derive_stage(unit) == Stage::Review)
        .filter_map(|unit| {
            let task = board.tasks.get(unit.id())?;
            let changed = task.last_changed.unwrap_or(now);
            let offset = offsets.get(unit.id()).copied().unwrap_or(0);
            let oldest_discussion_days = unit
                .members()
                .filter_map(|r| r.oldest_unresolved_discussion)
                .min()
                .map(|opened| (now - opened).num_days());
            Some(ReviewItem {
                id: unit.id().clone(),
                title: unit.title().to_string(),
                latency_days: (now - changed).num_days() + offset,
                unresolved_blockers: unit.unresolved_blockers.len(),
                oldest_discussion_days,
            })
        })
        .collect()
}

/// Total order over review items. Pure: the same set and the same `now`
/// always produce the same sequence, whatever order the input arrived in.
pub fn rank(mut items: Vec<ReviewItem>) -> Vec<ReviewItem> {
    items.sort_by(compare);
    items
}

fn compare(a: &ReviewItem, b: &ReviewItem) -> Ordering {
    a.latency_days
        .cmp(&b.latency_days)
        .then_with(|| b.unresolved_blockers.cmp(&a.unresolved_blockers))
        .then_with(|| cmp_discussion(a.oldest_discussion_days, b.oldest_discussion_days))
        .then_with(|| a.id.cmp(&b.id))
}

/// Items with no unresolved discussion sort after items with one.
fn cmp_discussion(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(number: u64, latency: i64, blockers: usize, discussion: Option<i64>) -> ReviewItem {
        ReviewItem {
            id: RecordId::issue("p", number),
            title: format!("Item {number}"),
            latency_days: latency,
            unresolved_blockers: blockers,
            oldest_discussion_days: discussion,
        }
    }

    fn ids(items: &[ReviewItem]) -> Vec<u64> {
        items.iter().map(|i| i.id.number).collect()
    }

    #[test]
    fn latency_dominates() {
        let ranked = rank(vec![item(1, 10, 5, Some(1)), item(2, 3, 0, None)]);
        assert_eq!(ids(&ranked), vec![2, 1]);
    }

    #[test]
    fn blockers_break_latency_ties_descending() {
        let ranked = rank(vec![item(1, 5, 1, None), item(2, 5, 4, None)]);
        assert_eq!(ids(&ranked), vec![2, 1]);
    }

    #[test]
    fn discussion_age_breaks_blocker_ties() {
        let ranked = rank(vec![
            item(1, 5, 2, None),
            item(2, 5, 2, Some(30)),
            item(3, 5, 2, Some(4)),
        ]);
        // youngest discussion first; no discussion sorts last
        assert_eq!(ids(&ranked), vec![3, 2, 1]);
    }

    #[test]
    fn numeric_id_is_the_final_tie_break() {
        let ranked = rank(vec![item(9, 5, 0, None), item(2, 5, 0, None)]);
        assert_eq!(ids(&ranked), vec![2, 9]);
    }

    #[test]
    fn ranking_is_input_order_insensitive() {
        let a = vec![
            item(1, 7, 0, None),
            item(2, 7, 3, Some(2)),
            item(3, 1, 0, None),
            item(4, 7, 3, Some(9)),
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(ids(&rank(a)), ids(&rank(b)));
    }

    #[test]
    fn repeated_calls_are_identical() {
        let items = vec![item(1, 2, 0, None), item(2, 2, 0, Some(5))];
        assert_eq!(ids(&rank(items.clone())), ids(&rank(items)));
    }

    mod collection {
        use std::collections::BTreeSet;

        use chrono::{DateTime, Duration, Utc};

        use super::*;
        use crate::model::board::{BoardState, BoardTask};
        use crate::model::record::{Record, RecordState};
        use crate::model::work_unit::WorkUnit;

        fn record(id: RecordId, now: DateTime<Utc>) -> Record {
            Record {
                title: format!("Record {}", id.number),
                id,
                state: RecordState::Open,
                labels: BTreeSet::new(),
                author: "dev".into(),
                created_at: now,
                updated_at: now,
                draft: false,
                url: None,
                oldest_unresolved_discussion: None,
            }
        }

        fn review_unit(now: DateTime<Utc>) -> WorkUnit {
            let mut unit = WorkUnit::new(record(RecordId::issue("p", 1), now));
            unit.secondaries
                .push(record(RecordId::merge_request("p", 2), now));
            unit
        }

        #[test]
        fn review_items_measure_latency_from_the_board() {
            let now = Utc::now();
            let mut unit = review_unit(now);
            unit.secondaries[0].oldest_unresolved_discussion = Some(now - Duration::days(3));

            let task = BoardTask {
                id: 1,
                title: "Record 1".into(),
                description: String::new(),
                column: "Needs Review".into(),
                swimlane: None,
                tags: BTreeSet::new(),
                subtasks: Vec::new(),
                reference: "p#1".into(),
                active: true,
                last_changed: Some(now - Duration::days(10)),
            };
            let board = BoardState::normalize(
                vec!["TODO".into(), "Needs Review".into(), "Done".into()],
                vec![task],
            );

            let mut offsets = HashMap::new();
            offsets.insert(RecordId::issue("p", 1), -4);

            let items = review_items(&[unit], &board, &offsets, now);
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].latency_days, 6); // 10 days - 4 offset
            assert_eq!(items[0].oldest_discussion_days, Some(3));
        }

        #[test]
        fn units_without_a_board_task_are_not_ranked() {
            let now = Utc::now();
            let unit = review_unit(now);
            let board = BoardState::default();
            let items = review_items(&[unit], &board, &HashMap::new(), now);
            assert!(items.is_empty());
        }

        #[test]
        fn non_review_units_are_filtered_out() {
            let now = Utc::now();
            // a bare issue with no open merge request is not awaiting review
            let unit = WorkUnit::new(record(RecordId::issue("p", 1), now));
            let items = review_items(&[unit], &BoardState::default(), &HashMap::new(), now);
            assert!(items.is_empty());
        }
    }
}
