use std::collections::BTreeSet;

use serde::Deserialize;

use crate::model::board::{BoardOperation, BoardState, BoardTask, TaskHandle};
use crate::model::record::{Record, RecordId, RecordKind, RecordState};
use crate::model::work_unit::WorkUnit;

/// Lifecycle stage derived from a unit's records; each stage maps to a board
/// column through [`ColumnMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Open,
    Review,
    Done,
}

/// The stage -> column table. Explicit configuration, validated against the
/// live board before any diffing happens.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMap {
    pub open: String,
    pub review: String,
    pub done: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            open: "TODO".into(),
            review: "Needs Review".into(),
            done: "Done".into(),
        }
    }
}

impl ColumnMap {
    pub fn column_for(&self, stage: Stage) -> &str {
        match stage {
            Stage::Open => &self.open,
            Stage::Review => &self.review,
            Stage::Done => &self.done,
        }
    }

    /// Every mapped column must exist on the live board; a typo here should
    /// stop the run before it emits a single operation.
    pub fn validate(&self, board: &BoardState) -> Result<(), ValidationError> {
        for name in [&self.open, &self.review, &self.done] {
            if board.column_rank(name).is_none() {
                return Err(ValidationError::UnknownColumn {
                    column: name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("column '{column}' does not exist on the board")]
    UnknownColumn { column: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub columns: ColumnMap,
    /// Tags with this prefix belong to humans; the engine never removes them.
    pub manual_tag_prefix: String,
    /// Close a done task instead of moving it into the done column.
    pub close_done: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            columns: ColumnMap::default(),
            manual_tag_prefix: "manual-".into(),
            close_done: false,
        }
    }
}

/// Everything one reconciliation pass decided: the operations to apply, in
/// dependency order, plus what was skipped and why.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub operations: Vec<BoardOperation>,
    pub skipped: Vec<(RecordId, String)>,
}

/// The stage a unit's records imply.
pub fn derive_stage(unit: &WorkUnit) -> Stage {
    match unit.primary.state {
        RecordState::Closed | RecordState::Merged => Stage::Done,
        RecordState::Open => {
            if awaiting_review(unit) {
                Stage::Review
            } else {
                Stage::Open
            }
        }
    }
}

/// An open, non-draft change request anywhere in the unit puts it in review.
fn awaiting_review(unit: &WorkUnit) -> bool {
    unit.members()
        .any(|r| r.id.kind == RecordKind::MergeRequest && r.state.is_open() && !r.draft)
}

fn member_line(record: &Record) -> String {
    let url = record.url.as_deref().unwrap_or("");
    let state = match record.state {
        RecordState::Closed => "(CLOSED) ",
        RecordState::Merged => "(MERGED) ",
        RecordState::Open => "",
    };
    format!("• {}: {}{} {}", record.id, state, record.title, url)
        .trim_end()
        .to_string()
}

fn render_description(unit: &WorkUnit) -> String {
    unit.secondaries
        .iter()
        .map(member_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge a freshly rendered member list into an existing description.
///
/// Lines that carry a record reference are regenerated; lines that carry none
/// are manual notes and survive verbatim. New member lines are appended.
pub fn merge_description(existing: &str, unit: &WorkUnit) -> String {
    let mut fresh: Vec<(RecordId, String)> = unit
        .secondaries
        .iter()
        .map(|r| (r.id.clone(), member_line(r)))
        .collect();

    let mut merged: Vec<String> = Vec::new();
    for line in existing.lines() {
        match RecordId::find_in_text(line) {
            Some(id) => {
                if let Some(pos) = fresh.iter().position(|(fid, _)| fid == &id) {
                    merged.push(fresh.remove(pos).1);
                } else {
                    // a ref we no longer track; keep the human's line
                    merged.push(line.to_string());
                }
            }
            None => merged.push(line.to_string()),
        }
    }
    for (_, line) in fresh {
        merged.push(line);
    }
    merged.join("\n")
}

fn subtask_title(record: &Record) -> String {
    format!("{}: {}", record.id, record.title)
}

/// Compute the operations that converge the board to the given units.
///
/// Re-running against a board that already matches yields an empty list;
/// that property is what makes partial failure safe, since whatever did not
/// get applied is simply re-emitted next run.
pub fn reconcile(
    units: &[WorkUnit],
    board: &BoardState,
    config: &EngineConfig,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    let mut created_refs: BTreeSet<RecordId> = BTreeSet::new();

    for unit in units {
        let stage = derive_stage(unit);
        let target_column = config.columns.column_for(stage);

        match board.tasks.get(unit.id()) {
            None => {
                // Done work never gets a fresh card. The snapshot only holds
                // open tasks, so creating here would resurrect every unit
                // whose card was closed on a previous run.
                if stage == Stage::Done {
                    log::debug!("{} is already done and has no card; leaving it", unit.id());
                    continue;
                }
                if board.column_rank(target_column).is_none() {
                    outcome.skipped.push((
                        unit.id().clone(),
                        format!("target column '{target_column}' missing from board"),
                    ));
                    continue;
                }
                if created_refs.contains(unit.id()) {
                    // one card per identity, whatever the unit list says
                    log::warn!("duplicate unit for {}; keeping the first", unit.id());
                    continue;
                }
                created_refs.insert(unit.id().clone());
                outcome.operations.push(BoardOperation::CreateTask {
                    reference: unit.id().clone(),
                    title: unit.title().to_string(),
                    description: render_description(unit),
                    column: target_column.to_string(),
                    swimlane: None,
                    tags: unit.labels(),
                });
                for secondary in &unit.secondaries {
                    outcome.operations.push(BoardOperation::UpsertSubtask {
                        parent: TaskHandle::Created(unit.id().clone()),
                        reference: secondary.id.clone(),
                        title: subtask_title(secondary),
                    });
                }
            }
            Some(task) => {
                diff_task(unit, task, stage, board, config, &mut outcome);
            }
        }
    }

    outcome
}

fn diff_task(
    unit: &WorkUnit,
    task: &BoardTask,
    stage: Stage,
    board: &BoardState,
    config: &EngineConfig,
    outcome: &mut ReconcileOutcome,
) {
    let ops = &mut outcome.operations;

    // title / description
    let merged_description = merge_description(&task.description, unit);
    let new_title = (task.title != unit.title()).then(|| unit.title().to_string());
    let new_description = (merged_description != task.description).then_some(merged_description);
    if new_title.is_some() || new_description.is_some() {
        ops.push(BoardOperation::UpdateTaskFields {
            task: task.id,
            title: new_title,
            description: new_description,
        });
    }

    // tags: derived labels plus whatever manual tags are already present
    let mut target_tags = unit.labels();
    for tag in &task.tags {
        if tag.starts_with(&config.manual_tag_prefix) {
            target_tags.insert(tag.clone());
        }
    }
    if target_tags != task.tags {
        ops.push(BoardOperation::SetTags {
            task: task.id,
            tags: target_tags,
        });
    }

    // column: forward only. A human who moved the card ahead of its derived
    // stage knows something the tracker does not.
    if stage == Stage::Done && config.close_done {
        if task.active {
            ops.push(BoardOperation::CloseTask { task: task.id });
        }
    } else {
        let target_column = config.columns.column_for(stage);
        match (
            board.column_rank(&task.column),
            board.column_rank(target_column),
        ) {
            (Some(current), Some(target)) if target > current => {
                ops.push(BoardOperation::MoveTask {
                    task: task.id,
                    column: target_column.to_string(),
                    position: board.column_len(target_column) as u64 + 1,
                });
            }
            (_, None) => outcome.skipped.push((
                unit.id().clone(),
                format!("target column '{target_column}' missing from board"),
            )),
            _ => {}
        }
    }

    // sub-tasks: upsert missing secondaries, never delete strays
    let existing_refs: Vec<RecordId> = task
        .subtasks
        .iter()
        .filter_map(|s| s.reference())
        .collect();
    for secondary in &unit.secondaries {
        if !existing_refs.contains(&secondary.id) {
            outcome.operations.push(BoardOperation::UpsertSubtask {
                parent: TaskHandle::Existing(task.id),
                reference: secondary.id.clone(),
                title: subtask_title(secondary),
            });
        }
    }
}
