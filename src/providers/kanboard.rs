use std::collections::{BTreeSet, HashMap};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{BoardProvider, FetchError, OpError};
use crate::model::board::{BoardOperation, BoardState, BoardTask, Subtask, TaskHandle};
use crate::model::record::RecordId;

/// Kanboard JSON-RPC collaborator. Kanboard serializes most numbers as
/// strings, so responses are picked apart as raw values instead of typed
/// structs.
pub struct KanboardProvider {
    endpoint: String,
    auth_header: String,
    project_id: u64,
    client: reqwest::Client,
    // column title -> id, filled on first use
    columns: Mutex<Option<HashMap<String, u64>>>,
}

impl KanboardProvider {
    pub fn new(base_url: String, token: String, project_id: u64) -> Self {
        let creds = format!("jsonrpc:{token}");
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        Self {
            endpoint: format!("{}/jsonrpc.php", base_url.trim_end_matches('/')),
            auth_header: format!("Basic {encoded}"),
            project_id,
            client: reqwest::Client::new(),
            columns: Mutex::new(None),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, FetchError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "id": 1,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", &self.auth_header)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(
                status,
                anyhow!("{method} returned {status}"),
            ));
        }
        let envelope: Value = resp
            .json()
            .await
            .with_context(|| format!("parsing {method} response"))
            .map_err(FetchError::Permanent)?;
        if let Some(error) = envelope.get("error") {
            return Err(FetchError::Permanent(anyhow!(
                "{method} failed: {error}"
            )));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn column_ids(&self) -> Result<HashMap<String, u64>, FetchError> {
        let mut cache = self.columns.lock().await;
        if let Some(map) = cache.as_ref() {
            return Ok(map.clone());
        }
        let result = self
            .call("getColumns", json!({"project_id": self.project_id}))
            .await?;
        let mut map = HashMap::new();
        for col in result.as_array().into_iter().flatten() {
            if let (Some(title), Some(id)) = (str_field(col, "title"), u64_field(col, "id")) {
                map.insert(title.to_string(), id);
            }
        }
        *cache = Some(map.clone());
        Ok(map)
    }

    async fn column_id(&self, name: &str) -> Result<u64, OpError> {
        let columns = self
            .column_ids()
            .await
            .map_err(|e| OpError::Api(anyhow!(e)))?;
        columns
            .get(name)
            .copied()
            .ok_or_else(|| OpError::Rejected(format!("no column named '{name}'")))
    }

    async fn op_call(&self, method: &str, params: Value) -> Result<Value, OpError> {
        self.call(method, params)
            .await
            .map_err(|e| OpError::Api(anyhow!(e)))
    }
}

/// Kanboard sends `"12"` and `12` interchangeably.
fn u64_field(value: &Value, field: &str) -> Option<u64> {
    match value.get(field)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn i64_field(value: &Value, field: &str) -> Option<i64> {
    match value.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

fn timestamp_field(value: &Value, field: &str) -> Option<DateTime<Utc>> {
    let secs = i64_field(value, field)?;
    if secs <= 0 {
        return None;
    }
    DateTime::from_timestamp(secs, 0)
}

#[async_trait]
impl BoardProvider for KanboardProvider {
    fn name(&self) -> &str {
        "Kanboard"
    }

    async fn fetch_board_state(&self) -> Result<BoardState, FetchError> {
        let columns_result = self
            .call("getColumns", json!({"project_id": self.project_id}))
            .await?;
        let mut columns: Vec<(u64, u64, String)> = columns_result
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|col| {
                Some((
                    u64_field(col, "position").unwrap_or(0),
                    u64_field(col, "id")?,
                    str_field(col, "title")?.to_string(),
                ))
            })
            .collect();
        columns.sort();
        let column_names: HashMap<u64, String> = columns
            .iter()
            .map(|(_, id, title)| (*id, title.clone()))
            .collect();
        let ordered_columns: Vec<String> =
            columns.into_iter().map(|(_, _, title)| title).collect();

        let swimlanes_result = self
            .call("getAllSwimlanes", json!({"project_id": self.project_id}))
            .await?;
        let swimlane_names: HashMap<u64, String> = swimlanes_result
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|lane| Some((u64_field(lane, "id")?, str_field(lane, "name")?.to_string())))
            .collect();

        // status_id 1 = open tasks only; closed tasks are out of scope for
        // diffing, reopening is a human decision
        let tasks_result = self
            .call(
                "getAllTasks",
                json!({"project_id": self.project_id, "status_id": 1}),
            )
            .await?;

        let mut raw_tasks = Vec::new();
        for task in tasks_result.as_array().into_iter().flatten() {
            let Some(id) = u64_field(task, "id") else {
                continue;
            };
            let (tags_result, subtasks_result) = tokio::try_join!(
                self.call("getTaskTags", json!({"task_id": id})),
                self.call("getAllSubtasks", json!({"task_id": id}))
            )?;

            let tags: BTreeSet<String> = match &tags_result {
                Value::Object(map) => map
                    .values()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Value::Array(list) => list
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => BTreeSet::new(),
            };

            let subtasks: Vec<Subtask> = subtasks_result
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|sub| {
                    Some(Subtask {
                        id: u64_field(sub, "id")?,
                        title: str_field(sub, "title")?.to_string(),
                    })
                })
                .collect();

            let column = u64_field(task, "column_id")
                .and_then(|cid| column_names.get(&cid).cloned())
                .unwrap_or_default();
            let swimlane =
                u64_field(task, "swimlane_id").and_then(|sid| swimlane_names.get(&sid).cloned());

            let date_moved = timestamp_field(task, "date_moved");
            let date_started = timestamp_field(task, "date_started");
            let last_changed = match (date_moved, date_started) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };

            raw_tasks.push(BoardTask {
                id,
                title: str_field(task, "title").unwrap_or_default().to_string(),
                description: str_field(task, "description").unwrap_or_default().to_string(),
                column,
                swimlane,
                tags,
                subtasks,
                reference: str_field(task, "reference").unwrap_or_default().to_string(),
                active: u64_field(task, "is_active").unwrap_or(1) == 1,
                last_changed,
            });
        }

        log::info!(
            "board project {}: {} columns, {} tasks",
            self.project_id,
            ordered_columns.len(),
            raw_tasks.len()
        );
        Ok(BoardState::normalize(ordered_columns, raw_tasks))
    }

    async fn apply_operation(
        &self,
        op: &BoardOperation,
        created: &HashMap<RecordId, u64>,
    ) -> Result<Option<u64>, OpError> {
        let op = op.resolve(created).ok_or_else(|| match op {
            BoardOperation::UpsertSubtask {
                parent: TaskHandle::Created(parent),
                ..
            } => OpError::UnresolvedParent(parent.clone()),
            _ => OpError::Rejected("unresolvable operation".into()),
        })?;

        match op {
            BoardOperation::CreateTask {
                reference,
                title,
                description,
                column,
                swimlane: _,
                tags,
            } => {
                let column_id = self.column_id(&column).await?;
                let result = self
                    .op_call(
                        "createTask",
                        json!({
                            "project_id": self.project_id,
                            "title": title,
                            "column_id": column_id,
                            "description": description,
                            "reference": reference.to_string(),
                            "tags": tags.iter().collect::<Vec<_>>(),
                        }),
                    )
                    .await?;
                let id = result
                    .as_u64()
                    .or_else(|| result.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| {
                        OpError::Rejected(format!("createTask returned {result}"))
                    })?;
                Ok(Some(id))
            }
            BoardOperation::UpdateTaskFields {
                task,
                title,
                description,
            } => {
                let mut params = serde_json::Map::new();
                params.insert("id".into(), json!(task));
                if let Some(title) = title {
                    params.insert("title".into(), json!(title));
                }
                if let Some(description) = description {
                    params.insert("description".into(), json!(description));
                }
                self.op_call("updateTask", Value::Object(params)).await?;
                Ok(None)
            }
            BoardOperation::MoveTask {
                task,
                column,
                position,
            } => {
                let column_id = self.column_id(&column).await?;
                let current = self.op_call("getTask", json!({"task_id": task})).await?;
                let swimlane_id = u64_field(&current, "swimlane_id").unwrap_or(0);
                self.op_call(
                    "moveTaskPosition",
                    json!({
                        "project_id": self.project_id,
                        "task_id": task,
                        "column_id": column_id,
                        "position": position,
                        "swimlane_id": swimlane_id,
                    }),
                )
                .await?;
                Ok(None)
            }
            BoardOperation::SetTags { task, tags } => {
                self.op_call(
                    "setTaskTags",
                    json!({
                        "project_id": self.project_id,
                        "task_id": task,
                        "tags": tags.iter().collect::<Vec<_>>(),
                    }),
                )
                .await?;
                Ok(None)
            }
            BoardOperation::UpsertSubtask { parent, title, .. } => {
                let parent_id = match parent {
                    TaskHandle::Existing(id) => id,
                    TaskHandle::Created(reference) => {
                        return Err(OpError::UnresolvedParent(reference));
                    }
                };
                self.op_call(
                    "createSubtask",
                    json!({"task_id": parent_id, "title": title}),
                )
                .await?;
                Ok(None)
            }
            BoardOperation::CloseTask { task } => {
                self.op_call("closeTask", json!({"task_id": task})).await?;
                Ok(None)
            }
        }
    }
}
