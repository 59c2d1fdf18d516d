use std::collections::HashMap;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::StreamExt;
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use log::{error, info};

use crate::app_state::AppState;
use crate::attachments;
use crate::auth::{current_user, User};
use crate::projects::{Project, ProjectStatus};
use crate::tasks::{ChatMessage, Column, Priority, Subtask, Task};

pub const BACKUP_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub user: BackupUser,
    pub data: BackupData,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupUser {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupData {
    pub projects: Vec<ProjectExport>,
    pub tasks: Vec<TaskExport>,
}

/// Project record as it appears in a backup file. Owner ids are never
/// exported; they are reassigned to the importing user.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectExport {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Option<ProjectStatus>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExport {
    pub id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub column: Option<Column>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub priority: Option<Priority>,
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
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    Merge,
    Replace,
}

impl Default for ImportMode {
    fn default() -> Self {
        ImportMode::Merge
    }
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    #[serde(default)]
    pub version: Option<String>,
    pub data: Option<BackupData>,
    #[serde(default)]
    pub mode: ImportMode,
}

impl From<&Project> for ProjectExport {
    fn from(project: &Project) -> Self {
        ProjectExport {
            id: project.project_id.clone(),
            title: project.title.clone(),
            description: project.description.clone(),
            status: Some(project.status),
            assignees: project.assignees.clone(),
            start_date: project.start_date,
            end_date: project.end_date,
            pinned: project.pinned,
            color: project.color.clone(),
            archived: project.archived,
            created_at: Some(project.created_at),
        }
    }
}

impl From<&Task> for TaskExport {
    fn from(task: &Task) -> Self {
        TaskExport {
            id: task.task_id.clone(),
            project_id: task.project_id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            column: Some(task.column),
            start_date: task.start_date,
            due_date: task.due_date,
            priority: Some(task.priority),
            completed_at: task.completed_at,
            subtasks: task.subtasks.clone(),
            tags: task.tags.clone(),
            chat_history: task.chat_history.clone(),
            assignees: task.assignees.clone(),
            created_at: Some(task.created_at),
        }
    }
}

/// Imported tasks point at the exporter's project ids; the map carries
/// old-to-new translations. Tasks whose project did not make it into the
/// backup become standalone.
pub fn remap_project_id(
    id_map: &HashMap<String, String>,
    old_id: Option<&str>,
) -> Option<String> {
    old_id.and_then(|id| id_map.get(id).cloned())
}

/// Exports written before versioning carry no version field and still
/// import; anything with an unrecognized version is rejected.
pub fn version_supported(version: Option<&str>) -> bool {
    match version {
        Some(v) => v == BACKUP_VERSION,
        None => true,
    }
}

/// GET /api/backup/export
pub async fn export_backup(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };

    let users_coll = data.mongodb.db.collection::<User>("users");
    let account = match users_coll.find_one(doc! { "userId": &user.id }).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            return HttpResponse::NotFound().json(serde_json::json!({ "error": "User not found" }));
        }
        Err(e) => {
            error!("Error fetching user: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let projects_coll = data.mongodb.db.collection::<Project>("projects");
    let mut cursor = match projects_coll.find(doc! { "userId": &user.id }).await {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error fetching projects: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };
    let mut projects = Vec::new();
    while let Some(result) = cursor.next().await {
        match result {
            Ok(project) => projects.push(ProjectExport::from(&project)),
            Err(e) => {
                error!("Error reading projects: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }

    let tasks_coll = data.mongodb.db.collection::<Task>("tasks");
    let mut cursor = match tasks_coll.find(doc! { "userId": &user.id }).await {
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
            Ok(task) => tasks.push(TaskExport::from(&task)),
            Err(e) => {
                error!("Error reading tasks: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }

    let document = BackupDocument {
        version: BACKUP_VERSION.to_string(),
        exported_at: Utc::now(),
        user: BackupUser {
            username: account.username,
            email: account.email,
        },
        data: BackupData { projects, tasks },
    };
    HttpResponse::Ok().json(document)
}

/// POST /api/backup/import
/// `replace` wipes the caller's projects, tasks, and attachments first;
/// `merge` leaves existing data alone. Writes are sequential, so a failure
/// mid-way can leave a partial import.
pub async fn import_backup(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<ImportRequest>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    let payload = payload.into_inner();

    if !version_supported(payload.version.as_deref()) {
        return HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "Unsupported backup version" }));
    }
    let backup = match payload.data {
        Some(backup) => backup,
        None => {
            return HttpResponse::BadRequest()
                .json(serde_json::json!({ "error": "Invalid backup data" }));
        }
    };

    let projects_coll = data.mongodb.db.collection::<Project>("projects");
    let tasks_coll = data.mongodb.db.collection::<Task>("tasks");

    if payload.mode == ImportMode::Replace {
        // Existing attachments hang off tasks that are about to go away.
        let mut cursor = match tasks_coll.find(doc! { "userId": &user.id }).await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!("Error fetching tasks: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        };
        let mut task_ids = Vec::new();
        while let Some(result) = cursor.next().await {
            match result {
                Ok(task) => task_ids.push(task.task_id),
                Err(e) => {
                    error!("Error reading tasks: {}", e);
                    return HttpResponse::InternalServerError()
                        .json(serde_json::json!({ "error": e.to_string() }));
                }
            }
        }
        if let Err(e) = attachments::remove_attachments_for_tasks(&data, &task_ids).await {
            error!("Error removing attachments: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
        if let Err(e) = tasks_coll.delete_many(doc! { "userId": &user.id }).await {
            error!("Error clearing tasks: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
        if let Err(e) = projects_coll.delete_many(doc! { "userId": &user.id }).await {
            error!("Error clearing projects: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    }

    let mut id_map: HashMap<String, String> = HashMap::new();
    let mut imported_projects = 0usize;
    for project in &backup.projects {
        let new_project = Project {
            project_id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            title: project.title.clone(),
            description: project.description.clone(),
            status: project.status.unwrap_or(ProjectStatus::Active),
            assignees: project.assignees.clone(),
            start_date: project.start_date,
            end_date: project.end_date,
            pinned: project.pinned,
            color: project.color.clone(),
            archived: project.archived,
            created_at: project.created_at.unwrap_or_else(Utc::now),
        };
        if let Err(e) = projects_coll.insert_one(&new_project).await {
            error!("Error importing project: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
        id_map.insert(project.id.clone(), new_project.project_id);
        imported_projects += 1;
    }

    let mut imported_tasks = 0usize;
    for task in &backup.tasks {
        let new_task = Task {
            task_id: Uuid::new_v4().to_string(),
            project_id: remap_project_id(&id_map, task.project_id.as_deref()),
            user_id: user.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            column: task.column.unwrap_or(Column::Todo),
            start_date: task.start_date,
            due_date: task.due_date,
            priority: task.priority.unwrap_or(Priority::P2),
            completed_at: task.completed_at,
            subtasks: task.subtasks.clone(),
            tags: task.tags.clone(),
            chat_history: task.chat_history.clone(),
            assignees: task.assignees.clone(),
            created_at: task.created_at.unwrap_or_else(Utc::now),
        };
        if let Err(e) = tasks_coll.insert_one(&new_task).await {
            error!("Error importing task: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
        imported_tasks += 1;
    }

    info!(
        "Import finished for {}: {} projects, {} tasks",
        user.id, imported_projects, imported_tasks
    );
    HttpResponse::Ok().json(serde_json::json!({
        "message": "Import finished",
        "imported": {
            "projects": imported_projects,
            "tasks": imported_tasks,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_with_unknown_projects_become_standalone() {
        let mut id_map = HashMap::new();
        id_map.insert("old-1".to_string(), "new-1".to_string());

        assert_eq!(remap_project_id(&id_map, Some("old-1")), Some("new-1".to_string()));
        assert_eq!(remap_project_id(&id_map, Some("old-2")), None);
        assert_eq!(remap_project_id(&id_map, None), None);
    }

    #[test]
    fn only_current_version_or_unversioned_payloads_import() {
        assert!(version_supported(Some("1.0")));
        assert!(version_supported(None));
        assert!(!version_supported(Some("2.0")));
    }

    #[test]
    fn import_mode_defaults_to_merge() {
        let request: ImportRequest = serde_json::from_str(
            r#"{ "data": { "projects": [], "tasks": [] } }"#,
        )
        .unwrap();
        assert_eq!(request.mode, ImportMode::Merge);
        assert!(request.data.is_some());
    }

    #[test]
    fn exported_document_round_trips() {
        let document = BackupDocument {
            version: BACKUP_VERSION.to_string(),
            exported_at: Utc::now(),
            user: BackupUser {
                username: "dana".to_string(),
                email: "dana@example.com".to_string(),
            },
            data: BackupData {
                projects: vec![ProjectExport {
                    id: "p1".to_string(),
                    title: "Site relaunch".to_string(),
                    description: String::new(),
                    status: Some(ProjectStatus::Active),
                    assignees: vec![],
                    start_date: None,
                    end_date: None,
                    pinned: false,
                    color: None,
                    archived: false,
                    created_at: Some(Utc::now()),
                }],
                tasks: vec![TaskExport {
                    id: "t1".to_string(),
                    project_id: Some("p1".to_string()),
                    title: "Write copy".to_string(),
                    description: String::new(),
                    column: Some(Column::Todo),
                    start_date: None,
                    due_date: None,
                    priority: Some(Priority::P2),
                    completed_at: None,
                    subtasks: vec![],
                    tags: vec![],
                    chat_history: vec![],
                    assignees: vec![],
                    created_at: None,
                }],
            },
        };

        let json = serde_json::to_string(&document).unwrap();
        let parsed: BackupDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version, BACKUP_VERSION);
        assert_eq!(parsed.data.projects[0].id, "p1");
        assert_eq!(parsed.data.tasks[0].project_id.as_deref(), Some("p1"));
    }
}
