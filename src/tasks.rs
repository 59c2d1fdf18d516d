use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::StreamExt;
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use log::{error, info};

use crate::app_state::AppState;
use crate::attachments;
use crate::auth::current_user;

/// Kanban lane a task lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Column {
    Backlog,
    Todo,
    InProgress,
    Done,
}

/// Eisenhower-matrix quadrant used by the daily view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_id: String,
    /// None for standalone tasks.
    #[serde(default)]
    pub project_id: Option<String>,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub column: Column,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default)]
    pub assignees: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    pub project_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub column: Option<Column>,
    pub start_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub priority: Option<Priority>,
    pub subtasks: Option<Vec<Subtask>>,
    pub tags: Option<Vec<String>>,
    pub chat_history: Option<Vec<ChatMessage>>,
    pub assignees: Option<Vec<String>>,
}

/// The UI edits tasks through a full-record PUT. `project_id`, `start_date`,
/// and `due_date` clear when omitted or null (that is how a task is detached
/// or a date removed); the remaining fields keep their stored value when
/// absent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    pub project_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub column: Option<Column>,
    pub start_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub priority: Option<Priority>,
    pub subtasks: Option<Vec<Subtask>>,
    pub tags: Option<Vec<String>>,
    pub chat_history: Option<Vec<ChatMessage>>,
    pub assignees: Option<Vec<String>>,
}

/// The server owns the completion timestamp: entering `done` stamps it,
/// leaving `done` clears it, staying in `done` preserves it.
pub fn completion_transition(
    previous: Column,
    next: Column,
    completed_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (previous == Column::Done, next == Column::Done) {
        (false, true) => Some(Utc::now()),
        (true, true) => completed_at,
        (_, false) => None,
    }
}

async fn owns_project(data: &AppState, project_id: &str, user_id: &str) -> bool {
    let projects = data
        .mongodb
        .db
        .collection::<mongodb::bson::Document>("projects");
    projects
        .find_one(doc! { "projectId": project_id, "userId": user_id })
        .await
        .ok()
        .flatten()
        .is_some()
}

/// GET /api/tasks
pub async fn list_tasks(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };

    let tasks_coll = data.mongodb.db.collection::<Task>("tasks");
    let mut cursor = match tasks_coll
        .find(doc! { "userId": &user.id })
        .sort(doc! { "createdAt": -1 })
        .await
    {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error fetching tasks: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let mut tasks = Vec::new();
    while let Some(result) = cursor.next().await {
        match result {
            Ok(task) => tasks.push(task),
            Err(e) => {
                error!("Error reading tasks: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }
    HttpResponse::Ok().json(tasks)
}

/// GET /api/tasks/project/{project_id}
pub async fn list_project_tasks(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    let project_id = path.into_inner();

    let tasks_coll = data.mongodb.db.collection::<Task>("tasks");
    let mut cursor = match tasks_coll
        .find(doc! { "projectId": &project_id, "userId": &user.id })
        .await
    {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error fetching project tasks: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let mut tasks = Vec::new();
    while let Some(result) = cursor.next().await {
        match result {
            Ok(task) => tasks.push(task),
            Err(e) => {
                error!("Error reading project tasks: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }
    HttpResponse::Ok().json(tasks)
}

/// POST /api/tasks
pub async fn create_task(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateTaskRequest>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };

    if payload.title.trim().is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": "Title is required" }));
    }

    if let Some(project_id) = &payload.project_id {
        if !owns_project(&data, project_id, &user.id).await {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": "Project not found" }));
        }
    }

    let new_task = Task {
        task_id: Uuid::new_v4().to_string(),
        project_id: payload.project_id.clone(),
        user_id: user.id.clone(),
        title: payload.title.trim().to_string(),
        description: payload.description.clone().unwrap_or_default(),
        column: payload.column.unwrap_or(Column::Todo),
        start_date: payload.start_date,
        due_date: payload.due_date,
        priority: payload.priority.unwrap_or(Priority::P2),
        completed_at: None,
        subtasks: payload.subtasks.clone().unwrap_or_default(),
        tags: payload.tags.clone().unwrap_or_default(),
        chat_history: payload.chat_history.clone().unwrap_or_default(),
        assignees: payload.assignees.clone().unwrap_or_default(),
        created_at: Utc::now(),
    };

    let tasks_coll = data.mongodb.db.collection::<Task>("tasks");
    match tasks_coll.insert_one(&new_task).await {
        Ok(_) => {
            info!("Task created: {}", new_task.task_id);
            HttpResponse::Ok().json(&new_task)
        }
        Err(e) => {
            error!("Error inserting task: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// PUT /api/tasks/{id}
pub async fn update_task(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateTaskRequest>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    let task_id = path.into_inner();

    let tasks_coll = data.mongodb.db.collection::<Task>("tasks");
    let existing = match tasks_coll
        .find_one(doc! { "taskId": &task_id, "userId": &user.id })
        .await
    {
        Ok(Some(task)) => task,
        Ok(None) => {
            return HttpResponse::NotFound().json(serde_json::json!({ "error": "Task not found" }));
        }
        Err(e) => {
            error!("Error fetching task: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let payload = payload.into_inner();
    if let Some(project_id) = &payload.project_id {
        if existing.project_id.as_deref() != Some(project_id.as_str())
            && !owns_project(&data, project_id, &user.id).await
        {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": "Project not found" }));
        }
    }

    let column = payload.column.unwrap_or(existing.column);
    let completed_at = completion_transition(existing.column, column, existing.completed_at);

    let updated = Task {
        task_id: existing.task_id.clone(),
        project_id: payload.project_id,
        user_id: existing.user_id.clone(),
        title: payload.title.unwrap_or(existing.title),
        description: payload.description.unwrap_or(existing.description),
        column,
        start_date: payload.start_date,
        due_date: payload.due_date,
        priority: payload.priority.unwrap_or(existing.priority),
        completed_at,
        subtasks: payload.subtasks.unwrap_or(existing.subtasks),
        tags: payload.tags.unwrap_or(existing.tags),
        chat_history: payload.chat_history.unwrap_or(existing.chat_history),
        assignees: payload.assignees.unwrap_or(existing.assignees),
        created_at: existing.created_at,
    };

    match tasks_coll
        .replace_one(doc! { "taskId": &task_id, "userId": &user.id }, &updated)
        .await
    {
        Ok(_) => HttpResponse::Ok().json(&updated),
        Err(e) => {
            error!("Error updating task: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// DELETE /api/tasks/{id}
pub async fn delete_task(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    let task_id = path.into_inner();

    let tasks_coll = data.mongodb.db.collection::<Task>("tasks");
    match tasks_coll
        .find_one(doc! { "taskId": &task_id, "userId": &user.id })
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HttpResponse::NotFound().json(serde_json::json!({ "error": "Task not found" }));
        }
        Err(e) => {
            error!("Error fetching task: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    }

    if let Err(e) = attachments::remove_attachments_for_tasks(&data, &[task_id.clone()]).await {
        error!("Error removing task attachments: {}", e);
        return HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": e.to_string() }));
    }

    match tasks_coll
        .delete_one(doc! { "taskId": &task_id, "userId": &user.id })
        .await
    {
        Ok(res) if res.deleted_count == 1 => {
            info!("Task deleted: {}", task_id);
            HttpResponse::Ok().json(serde_json::json!({ "message": "Task deleted" }))
        }
        Ok(_) => HttpResponse::NotFound().json(serde_json::json!({ "error": "Task not found" })),
        Err(e) => {
            error!("Error deleting task: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entering_done_sets_completion_timestamp() {
        let stamped = completion_transition(Column::Todo, Column::Done, None);
        assert!(stamped.is_some());
    }

    #[test]
    fn leaving_done_clears_completion_timestamp() {
        let stamp = Some(Utc::now());
        assert_eq!(completion_transition(Column::Done, Column::InProgress, stamp), None);
        assert_eq!(completion_transition(Column::Done, Column::Backlog, stamp), None);
    }

    #[test]
    fn staying_in_done_preserves_original_timestamp() {
        let stamp = Some(Utc::now() - chrono::Duration::hours(3));
        assert_eq!(completion_transition(Column::Done, Column::Done, stamp), stamp);
    }

    #[test]
    fn staying_outside_done_never_carries_a_timestamp() {
        assert_eq!(completion_transition(Column::Todo, Column::InProgress, None), None);
    }

    #[test]
    fn column_uses_kebab_case_wire_names() {
        assert_eq!(serde_json::to_string(&Column::InProgress).unwrap(), "\"in-progress\"");
        let parsed: Column = serde_json::from_str("\"backlog\"").unwrap();
        assert_eq!(parsed, Column::Backlog);
    }

    #[test]
    fn priority_quadrants_use_lowercase_wire_names() {
        assert_eq!(serde_json::to_string(&Priority::P1).unwrap(), "\"p1\"");
        let parsed: Priority = serde_json::from_str("\"p4\"").unwrap();
        assert_eq!(parsed, Priority::P4);
    }

    #[test]
    fn task_json_uses_camel_case_and_nullable_project() {
        let task = Task {
            task_id: "t1".to_string(),
            project_id: None,
            user_id: "u1".to_string(),
            title: "standalone".to_string(),
            description: String::new(),
            column: Column::Todo,
            start_date: None,
            due_date: None,
            priority: Priority::P2,
            completed_at: None,
            subtasks: vec![Subtask { text: "step".to_string(), done: false }],
            tags: vec![],
            chat_history: vec![],
            assignees: vec![],
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&task).unwrap();
        assert!(json["projectId"].is_null());
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["subtasks"][0]["done"], false);
    }
}
