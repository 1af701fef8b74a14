use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth;
use crate::db::{Database, TaskListQuery};
use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Failure,
    Abandoned,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failure => "failure",
            TaskState::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<TaskState> {
        match s {
            "queued" => Some(TaskState::Queued),
            "running" => Some(TaskState::Running),
            "success" => Some(TaskState::Success),
            "failure" => Some(TaskState::Failure),
            "abandoned" => Some(TaskState::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure | TaskState::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn sql(self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// One reconstructed record per producer-assigned task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub error: Option<String>,
    pub worker: Option<String>,
    pub execution_time: Option<f64>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub args: Value,
    pub kwargs: Value,
    pub return_value: Option<Value>,
}

/// Columns a lifecycle event may overwrite on a record that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskField {
    QueuedAt,
    StartedAt,
    State,
    Error,
    FinishedAt,
    ReturnValue,
    ExecutionTime,
}

impl TaskField {
    pub fn column(self) -> &'static str {
        match self {
            TaskField::QueuedAt => "queued_at",
            TaskField::StartedAt => "started_at",
            TaskField::State => "state",
            TaskField::Error => "error",
            TaskField::FinishedAt => "finished_at",
            TaskField::ReturnValue => "return_value",
            TaskField::ExecutionTime => "execution_time",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedBody {
    pub task_name: String,
    pub queued_at: DateTime<Utc>,
    pub args: Value,
    pub worker: Option<String>,
    pub kwargs: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedBody {
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub args: Value,
    pub worker: Option<String>,
    pub kwargs: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedBody {
    pub error: Option<String>,
    pub execution_time: f64,
    pub finished_at: DateTime<Utc>,
    pub return_value: Option<Value>,
}

/// The three worker notifications. Each variant knows which columns it is
/// authoritative for, so arrival order and duplication cannot corrupt the
/// reconstructed lifecycle: the conflict rules live here as data, not as
/// branches in the handlers.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Queued(QueuedBody),
    Started(StartedBody),
    Executed(ExecutedBody),
}

impl LifecycleEvent {
    /// Columns overwritten when the record already exists.
    pub fn overwrites(&self) -> &'static [TaskField] {
        match self {
            LifecycleEvent::Queued(_) => &[TaskField::QueuedAt],
            LifecycleEvent::Started(_) => &[TaskField::StartedAt],
            LifecycleEvent::Executed(_) => &[
                TaskField::State,
                TaskField::Error,
                TaskField::FinishedAt,
                TaskField::ReturnValue,
                TaskField::ExecutionTime,
            ],
        }
    }

    /// Full row inserted when this is the first event seen for the id.
    ///
    /// `started` back-fills queuedAt with startedAt as a placeholder; the real
    /// value lands once the queued notification arrives, since that event owns
    /// the queuedAt column. `executed` back-fills queuedAt with finishedAt and
    /// leaves the identity fields empty for the same reason: a terminal
    /// notification can outrun the queued one over the network.
    pub fn candidate(&self, id: &str) -> Task {
        match self {
            LifecycleEvent::Queued(body) => Task {
                id: id.to_string(),
                name: body.task_name.clone(),
                state: TaskState::Queued,
                error: None,
                worker: body.worker.clone(),
                execution_time: None,
                queued_at: body.queued_at,
                started_at: None,
                finished_at: None,
                args: body.args.clone(),
                kwargs: body.kwargs.clone(),
                return_value: None,
            },
            LifecycleEvent::Started(body) => Task {
                id: id.to_string(),
                name: body.task_name.clone(),
                state: TaskState::Running,
                error: None,
                worker: body.worker.clone(),
                execution_time: None,
                queued_at: body.started_at,
                started_at: Some(body.started_at),
                finished_at: None,
                args: body.args.clone(),
                kwargs: body.kwargs.clone(),
                return_value: None,
            },
            LifecycleEvent::Executed(body) => Task {
                id: id.to_string(),
                name: String::new(),
                state: if body.error.is_some() {
                    TaskState::Failure
                } else {
                    TaskState::Success
                },
                error: body.error.clone(),
                worker: None,
                execution_time: Some(body.execution_time),
                queued_at: body.finished_at,
                started_at: None,
                finished_at: Some(body.finished_at),
                args: json!([]),
                kwargs: json!({}),
                return_value: body.return_value.clone(),
            },
        }
    }
}

/// Apply one event: a single field-scoped upsert plus, for `started`, the
/// guarded state promotion. Safe under any interleaving for one id.
pub fn apply_event(db: &Database, id: &str, event: &LifecycleEvent) -> Result<(), rusqlite::Error> {
    db.upsert_task(&event.candidate(id), event.overwrites())?;
    if let LifecycleEvent::Started(body) = event {
        db.promote_to_running(id, body.started_at)?;
    }
    Ok(())
}

// === HTTP handlers ===

pub async fn task_queued(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<QueuedBody>,
) -> Result<Json<Value>, ApiError> {
    auth::require_token(&headers, &state.access_token)?;
    let db = state.db.lock().await;
    apply_event(&db, &id, &LifecycleEvent::Queued(body))?;
    Ok(Json(json!({ "success": true })))
}

pub async fn task_started(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<StartedBody>,
) -> Result<Json<Value>, ApiError> {
    auth::require_token(&headers, &state.access_token)?;
    let db = state.db.lock().await;
    apply_event(&db, &id, &LifecycleEvent::Started(body))?;
    Ok(Json(json!({ "success": true })))
}

pub async fn task_executed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExecutedBody>,
) -> Result<Json<Value>, ApiError> {
    auth::require_token(&headers, &state.access_token)?;
    let db = state.db.lock().await;
    apply_event(&db, &id, &LifecycleEvent::Executed(body))?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListTasksParams {
    pub search: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub state: Option<TaskState>,
    pub sort_by_runtime: Option<SortDir>,
    pub sort_by_started_at: Option<SortDir>,
    pub sort_by_queued_at: Option<SortDir>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
    pub count: i64,
}

fn parse_date(s: &str) -> Result<DateTime<Utc>, ApiError> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ApiError::Validation(format!("invalid date: {s}")))?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListTasksParams>,
) -> Result<Json<ListTasksResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50);
    let offset = params.offset.unwrap_or(0);
    if limit < 0 || offset < 0 {
        return Err(ApiError::Validation("limit and offset must be non-negative".to_string()));
    }

    let query = TaskListQuery {
        name: params.search.filter(|s| !s.is_empty()),
        state: params.state,
        started_after: params.start_date.as_deref().map(parse_date).transpose()?,
        started_before: params.end_date.as_deref().map(parse_date).transpose()?,
        sort_by_runtime: params.sort_by_runtime,
        sort_by_started_at: params.sort_by_started_at,
        sort_by_queued_at: params.sort_by_queued_at,
        limit,
        offset,
    };

    let db = state.db.lock().await;
    let (tasks, count) = db.list_tasks(&query)?;
    Ok(Json(ListTasksResponse { tasks, count }))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let db = state.db.lock().await;
    match db.get_task(&id)? {
        Some(task) => Ok(Json(task)),
        None => Err(ApiError::NotFound),
    }
}

/// Streams a consistent snapshot of the store as a downloadable file.
pub async fn backup(State(state): State<AppState>) -> Result<Response, ApiError> {
    {
        let db = state.db.lock().await;
        db.backup_to(&state.backup_path)?;
    }
    let bytes = tokio::fs::read(&state.backup_path).await?;

    let filename = format!("{}-backup.db", Utc::now().format("%Y-%m-%d %H-%M-%S"));
    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, Bytes::from(bytes)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, secs).unwrap()
    }

    fn queued(at: DateTime<Utc>) -> LifecycleEvent {
        LifecycleEvent::Queued(QueuedBody {
            task_name: "demo".to_string(),
            queued_at: at,
            args: json!([]),
            worker: Some("w".to_string()),
            kwargs: json!({}),
        })
    }

    fn started(at: DateTime<Utc>) -> LifecycleEvent {
        LifecycleEvent::Started(StartedBody {
            task_name: "demo".to_string(),
            started_at: at,
            args: json!([]),
            worker: Some("w".to_string()),
            kwargs: json!({}),
        })
    }

    fn executed(error: Option<&str>, finished_at: DateTime<Utc>) -> LifecycleEvent {
        LifecycleEvent::Executed(ExecutedBody {
            error: error.map(str::to_string),
            execution_time: 3.0,
            finished_at,
            return_value: Some(json!({ "return_value": "ok" })),
        })
    }

    #[test]
    fn happy_path_queued_started_executed() {
        let db = Database::in_memory().unwrap();
        apply_event(&db, "a", &queued(ts(0))).unwrap();
        apply_event(&db, "a", &started(ts(2))).unwrap();
        apply_event(&db, "a", &executed(None, ts(5))).unwrap();

        let task = db.get_task("a").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Success);
        assert_eq!(task.queued_at, ts(0));
        assert_eq!(task.started_at, Some(ts(2)));
        assert_eq!(task.finished_at, Some(ts(5)));
        assert_eq!(task.execution_time, Some(3.0));
    }

    #[test]
    fn started_before_queued_backfills_then_corrects_queued_at() {
        let db = Database::in_memory().unwrap();
        apply_event(&db, "a", &started(ts(2))).unwrap();

        // Placeholder until the real queued event lands.
        let task = db.get_task("a").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Running);
        assert_eq!(task.queued_at, ts(2));
        assert_eq!(task.started_at, Some(ts(2)));

        apply_event(&db, "a", &queued(ts(0))).unwrap();
        let task = db.get_task("a").unwrap().unwrap();
        assert_eq!(task.queued_at, ts(0));
        assert_eq!(task.started_at, Some(ts(2)));
        assert_eq!(task.state, TaskState::Running);
    }

    #[test]
    fn end_to_end_started_queued_executed_scenario() {
        let db = Database::in_memory().unwrap();
        apply_event(&db, "A", &started(ts(2))).unwrap();
        apply_event(&db, "A", &queued(ts(0))).unwrap();
        apply_event(&db, "A", &executed(None, ts(5))).unwrap();

        let task = db.get_task("A").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Success);
        assert_eq!(task.queued_at, ts(0));
        assert_eq!(task.started_at, Some(ts(2)));
        assert_eq!(task.finished_at, Some(ts(5)));
    }

    #[test]
    fn terminal_state_survives_late_queued_and_started() {
        let db = Database::in_memory().unwrap();
        apply_event(&db, "a", &executed(None, ts(5))).unwrap();
        apply_event(&db, "a", &queued(ts(0))).unwrap();
        apply_event(&db, "a", &started(ts(2))).unwrap();

        let task = db.get_task("a").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Success);
        assert_eq!(task.queued_at, ts(0));
        assert_eq!(task.started_at, Some(ts(2)));
        assert_eq!(task.finished_at, Some(ts(5)));
    }

    #[test]
    fn started_after_executed_does_not_regress_failure() {
        let db = Database::in_memory().unwrap();
        apply_event(&db, "a", &queued(ts(0))).unwrap();
        apply_event(&db, "a", &executed(Some("boom"), ts(5))).unwrap();
        apply_event(&db, "a", &started(ts(2))).unwrap();

        let task = db.get_task("a").unwrap().unwrap();
        assert_eq!(task.state, TaskState::Failure);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert_eq!(task.started_at, Some(ts(2)));
    }

    #[test]
    fn events_are_idempotent() {
        let db = Database::in_memory().unwrap();
        for event in [queued(ts(0)), started(ts(2)), executed(None, ts(5))] {
            apply_event(&db, "a", &event).unwrap();
            let before = db.get_task("a").unwrap().unwrap();
            apply_event(&db, "a", &event).unwrap();
            let after = db.get_task("a").unwrap().unwrap();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn queued_and_started_own_disjoint_timestamps() {
        let db = Database::in_memory().unwrap();
        apply_event(&db, "a", &queued(ts(0))).unwrap();
        apply_event(&db, "a", &started(ts(2))).unwrap();

        // A duplicate started with a different clock must not move queuedAt,
        // and a duplicate queued must not move startedAt.
        apply_event(&db, "a", &started(ts(3))).unwrap();
        let task = db.get_task("a").unwrap().unwrap();
        assert_eq!(task.queued_at, ts(0));

        apply_event(&db, "a", &queued(ts(1))).unwrap();
        let task = db.get_task("a").unwrap().unwrap();
        assert_eq!(task.started_at, Some(ts(3)));
        assert_eq!(task.queued_at, ts(1));
    }

    #[test]
    fn executed_error_selects_failure_state() {
        let db = Database::in_memory().unwrap();
        apply_event(&db, "a", &queued(ts(0))).unwrap();
        apply_event(&db, "a", &executed(Some("timeout"), ts(5))).unwrap();
        assert_eq!(db.get_task("a").unwrap().unwrap().state, TaskState::Failure);

        apply_event(&db, "b", &queued(ts(0))).unwrap();
        apply_event(&db, "b", &executed(None, ts(5))).unwrap();
        assert_eq!(db.get_task("b").unwrap().unwrap().state, TaskState::Success);
    }

    #[test]
    fn terminal_states_are_closed_set() {
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failure.is_terminal());
        assert!(TaskState::Abandoned.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}
