//! Task list domain types and their table layout.
//!
//! All records of one user share the partition `USER#{sub}`. A list lives at
//! `LIST#{listID}` and each of its tasks at `LIST#{listID}#TASK#{taskID}`, so
//! a list and its tasks are one prefix query away.

use crate::errors::ApiError;
use infra::table::ItemKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Longest accepted title.
pub const MAX_TITLE_LEN: usize = 200;

/// Partition key of a user's records.
pub fn user_pk(sub: &str) -> String {
    format!("USER#{sub}")
}

/// Sort key of a list record.
pub fn list_sk(list_id: &str) -> String {
    format!("LIST#{list_id}")
}

/// Sort key prefix shared by every task of a list.
pub fn task_prefix(list_id: &str) -> String {
    format!("LIST#{list_id}#TASK#")
}

/// Sort key of a task record.
pub fn task_sk(list_id: &str, task_id: &str) -> String {
    format!("{}{task_id}", task_prefix(list_id))
}

/// Checks an id taken from a request path. Ids never contain the key separator,
/// so an id that does cannot name an existing list or task.
pub fn validate_id<'a>(kind: &str, id: &'a str) -> Result<&'a str, ApiError> {
    if id.is_empty() || id.contains('#') {
        return Err(ApiError::NotFound(format!("{kind} {id} not found")));
    }
    Ok(id)
}

/// Sort key prefix of every list and task record.
pub const ALL_LISTS_PREFIX: &str = "LIST#";

/// Completion state of a list or task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Open,
    Done,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "done" => Ok(Self::Done),
            other => Err(ApiError::BadRequest(format!(
                "Invalid status {other:?}, expected \"open\" or \"done\""
            ))),
        }
    }
}

/// Which kind of entity a record stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    List,
    Task,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Task => "task",
        }
    }
}

impl FromStr for RecordKind {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list" => Ok(Self::List),
            "task" => Ok(Self::Task),
            other => Err(ApiError::Database(format!("Unknown record type {other:?}"))),
        }
    }
}

/// One row of the items table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: ItemKey,
    pub kind: RecordKind,
    pub list_id: String,
    pub task_id: Option<String>,
    pub title: String,
    pub status: Status,
    pub created_at: String,
    pub updated_at: String,
}

impl Record {
    /// New open list owned by `sub`.
    pub fn new_list(sub: &str, list_id: &str, title: &str, now: &str) -> Result<Self, ApiError> {
        Ok(Self {
            key: key(user_pk(sub), list_sk(list_id))?,
            kind: RecordKind::List,
            list_id: list_id.to_string(),
            task_id: None,
            title: title.to_string(),
            status: Status::Open,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        })
    }

    /// New open task in list `list_id`.
    pub fn new_task(
        sub: &str,
        list_id: &str,
        task_id: &str,
        title: &str,
        now: &str,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            key: key(user_pk(sub), task_sk(list_id, task_id))?,
            kind: RecordKind::Task,
            list_id: list_id.to_string(),
            task_id: Some(task_id.to_string()),
            title: title.to_string(),
            status: Status::Open,
            created_at: now.to_string(),
            updated_at: now.to_string(),
        })
    }
}

/// Attribute changes applied to an existing record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub title: Option<String>,
    pub status: Option<Status>,
    pub updated_at: String,
}

/// Builds a table key, mapping the empty-key rejection to a bad request.
pub fn key(pk: String, sk: String) -> Result<ItemKey, ApiError> {
    ItemKey::new(pk, sk).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// A task as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub title: String,
    pub status: Status,
    pub created_at: String,
    pub updated_at: String,
}

/// A list with its tasks, as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    #[serde(rename = "listID")]
    pub list_id: String,
    pub title: String,
    pub status: Status,
    pub created_at: String,
    pub updated_at: String,
    pub tasks: Vec<Task>,
}

impl TaskList {
    /// Assembles a list from its record and its task records, tasks in creation order.
    pub fn from_records(list: Record, tasks: Vec<Record>) -> Self {
        let mut tasks: Vec<Task> = tasks
            .into_iter()
            .filter(|r| r.kind == RecordKind::Task && r.list_id == list.list_id)
            .map(|r| Task {
                task_id: r.task_id.unwrap_or_default(),
                title: r.title,
                status: r.status,
                created_at: r.created_at,
                updated_at: r.updated_at,
            })
            .collect();
        tasks.sort_by(|a, b| (&a.created_at, &a.task_id).cmp(&(&b.created_at, &b.task_id)));

        Self {
            list_id: list.list_id,
            title: list.title,
            status: list.status,
            created_at: list.created_at,
            updated_at: list.updated_at,
            tasks,
        }
    }

    /// Groups every record of a user into lists, oldest list first.
    pub fn group(records: Vec<Record>) -> Vec<TaskList> {
        let (lists, tasks): (Vec<Record>, Vec<Record>) = records
            .into_iter()
            .partition(|r| r.kind == RecordKind::List);

        let mut grouped: Vec<TaskList> = lists
            .into_iter()
            .map(|list| {
                let own = tasks
                    .iter()
                    .filter(|t| t.list_id == list.list_id)
                    .cloned()
                    .collect();
                TaskList::from_records(list, own)
            })
            .collect();
        grouped.sort_by(|a, b| (&a.created_at, &a.list_id).cmp(&(&b.created_at, &b.list_id)));
        grouped
    }
}

/// `POST /items` body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateListRequest {
    pub title: String,
    #[serde(default)]
    pub tasks: Vec<NewTask>,
}

/// A task to add.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub title: String,
}

/// `PATCH /items/{listID}` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateListRequest {
    pub title: Option<String>,
    pub tasks: Option<Vec<NewTask>>,
}

/// Body of both status routes.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

/// Trims and checks a title.
pub fn validate_title(title: &str) -> Result<String, ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Title must not be empty".to_string()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ApiError::BadRequest(format!(
            "Title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    Ok(title.to_string())
}

/// Current time as RFC 3339.
pub fn now() -> Result<String, ApiError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| ApiError::Internal(format!("Failed to format timestamp: {e}")))
}
