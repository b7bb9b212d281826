use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::RecordId;

/// One sub-task on a board card. The record it mirrors is embedded in its
/// title, which is how reconciliation matches it back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: u64,
    pub title: String,
}

impl Subtask {
    pub fn reference(&self) -> Option<RecordId> {
        RecordId::find_in_text(&self.title)
    }
}

/// Read-only snapshot of one card on the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardTask {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub column: String,
    pub swimlane: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    /// The board's external-reference field; expected to hold a canonical
    /// record reference for tasks this tool manages.
    #[serde(default)]
    pub reference: String,
    pub active: bool,
    /// Most recent of the task's moved/started dates; latency input.
    pub last_changed: Option<DateTime<Utc>>,
}

/// Normalized snapshot of the whole board for one reconciliation run.
///
/// Tasks whose reference field is empty or malformed are kept in `unmatched`:
/// they are never candidates for an update and never deleted. Deleting a board
/// task is always a human decision, not something inferred from an
/// unrecognized reference.
#[derive(Debug, Clone, Default)]
pub struct BoardState {
    pub tasks: HashMap<RecordId, BoardTask>,
    /// Column names in board order; the order defines forward movement.
    pub columns: Vec<String>,
    pub unmatched: Vec<BoardTask>,
}

impl BoardState {
    pub fn normalize(columns: Vec<String>, raw_tasks: Vec<BoardTask>) -> BoardState {
        let mut tasks = HashMap::new();
        let mut unmatched = Vec::new();
        for task in raw_tasks {
            match task.reference.parse::<RecordId>() {
                Ok(id) => {
                    if let Some(previous) = tasks.insert(id.clone(), task) {
                        log::warn!(
                            "board has more than one task with reference {id}; \
                             keeping task {}, ignoring task {}",
                            tasks[&id].id,
                            previous.id
                        );
                    }
                }
                Err(_) => {
                    if !task.reference.is_empty() {
                        log::warn!(
                            "task {} has a malformed reference '{}'; leaving it alone",
                            task.id,
                            task.reference
                        );
                    }
                    unmatched.push(task);
                }
            }
        }
        BoardState {
            tasks,
            columns,
            unmatched,
        }
    }

    /// Rank of a column for forward-only movement; unknown columns have no rank.
    pub fn column_rank(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// How many matched tasks currently sit in the named column.
    pub fn column_len(&self, name: &str) -> usize {
        self.tasks.values().filter(|t| t.column == name).count()
    }
}

/// Handle to a board task from the point of view of an operation list: either
/// a task that already exists, or one a `CreateTask` earlier in the same list
/// will create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskHandle {
    Existing(u64),
    Created(RecordId),
}

/// One board mutation. Operations are data: the engine emits them, the board
/// collaborator applies them, and each one is serialized to the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BoardOperation {
    CreateTask {
        reference: RecordId,
        title: String,
        description: String,
        column: String,
        swimlane: Option<String>,
        tags: BTreeSet<String>,
    },
    UpdateTaskFields {
        task: u64,
        title: Option<String>,
        description: Option<String>,
    },
    MoveTask {
        task: u64,
        column: String,
        position: u64,
    },
    SetTags {
        task: u64,
        tags: BTreeSet<String>,
    },
    UpsertSubtask {
        parent: TaskHandle,
        reference: RecordId,
        title: String,
    },
    CloseTask {
        task: u64,
    },
}

impl BoardOperation {
    /// The reference a `CreateTask` will register, if this is one.
    pub fn creates(&self) -> Option<&RecordId> {
        match self {
            BoardOperation::CreateTask { reference, .. } => Some(reference),
            _ => None,
        }
    }

    /// Replace a `Created` parent handle with the task id assigned by the
    /// board, once the creation has been acknowledged.
    pub fn resolve(&self, created: &HashMap<RecordId, u64>) -> Option<BoardOperation> {
        match self {
            BoardOperation::UpsertSubtask {
                parent: TaskHandle::Created(reference),
                reference: sub_ref,
                title,
            } => created.get(reference).map(|id| BoardOperation::UpsertSubtask {
                parent: TaskHandle::Existing(*id),
                reference: sub_ref.clone(),
                title: title.clone(),
            }),
            _ => Some(self.clone()),
        }
    }
}
