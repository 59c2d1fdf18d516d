use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::{NaiveDate, Utc};
use futures_util::StreamExt;
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use log::{error, info};

use crate::app_state::AppState;
use crate::attachments;
use crate::auth::current_user;
use crate::tasks::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Pending,
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub project_id: String,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: ProjectStatus,
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
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub title: String,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub assignees: Option<Vec<String>>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateProjectRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub assignees: Option<Vec<String>>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub pinned: Option<bool>,
    pub color: Option<String>,
    pub archived: Option<bool>,
}

/// GET /api/projects
pub async fn list_projects(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };

    let projects_coll = data.mongodb.db.collection::<Project>("projects");
    let mut cursor = match projects_coll
        .find(doc! { "userId": &user.id })
        .sort(doc! { "createdAt": -1 })
        .await
    {
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
            Ok(project) => projects.push(project),
            Err(e) => {
                error!("Error reading projects: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }
    HttpResponse::Ok().json(projects)
}

/// POST /api/projects
pub async fn create_project(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateProjectRequest>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };

    if payload.title.trim().is_empty() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": "Title is required" }));
    }

    let new_project = Project {
        project_id: Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        title: payload.title.trim().to_string(),
        description: payload.description.clone().unwrap_or_default(),
        status: payload.status.unwrap_or(ProjectStatus::Active),
        assignees: payload.assignees.clone().unwrap_or_default(),
        start_date: payload.start_date.or_else(|| Some(Utc::now().date_naive())),
        end_date: payload.end_date,
        pinned: false,
        color: None,
        archived: false,
        created_at: Utc::now(),
    };

    let projects_coll = data.mongodb.db.collection::<Project>("projects");
    match projects_coll.insert_one(&new_project).await {
        Ok(_) => {
            info!("Project created: {}", new_project.project_id);
            HttpResponse::Ok().json(&new_project)
        }
        Err(e) => {
            error!("Error inserting project: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// PUT /api/projects/{id}
/// Field-presence partial update; absent fields stay untouched.
pub async fn update_project(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateProjectRequest>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    let project_id = path.into_inner();

    let projects_coll = data.mongodb.db.collection::<Project>("projects");
    let mut project = match projects_coll
        .find_one(doc! { "projectId": &project_id, "userId": &user.id })
        .await
    {
        Ok(Some(project)) => project,
        Ok(None) => {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": "Project not found" }));
        }
        Err(e) => {
            error!("Error fetching project: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let payload = payload.into_inner();
    if let Some(title) = payload.title {
        if !title.trim().is_empty() {
            project.title = title.trim().to_string();
        }
    }
    if let Some(description) = payload.description {
        project.description = description;
    }
    if let Some(status) = payload.status {
        project.status = status;
    }
    if let Some(assignees) = payload.assignees {
        project.assignees = assignees;
    }
    if let Some(start_date) = payload.start_date {
        project.start_date = Some(start_date);
    }
    if let Some(end_date) = payload.end_date {
        project.end_date = Some(end_date);
    }
    if let Some(pinned) = payload.pinned {
        project.pinned = pinned;
    }
    if let Some(color) = payload.color {
        // An empty string clears the color tag.
        project.color = if color.is_empty() { None } else { Some(color) };
    }
    if let Some(archived) = payload.archived {
        project.archived = archived;
    }

    match projects_coll
        .replace_one(doc! { "projectId": &project_id, "userId": &user.id }, &project)
        .await
    {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({
            "message": "Project updated",
            "project": project,
        })),
        Err(e) => {
            error!("Error updating project: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// DELETE /api/projects/{id}
/// Cascades to the project's tasks and their attachments.
pub async fn delete_project(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    let project_id = path.into_inner();

    let projects_coll = data.mongodb.db.collection::<Project>("projects");
    match projects_coll
        .find_one(doc! { "projectId": &project_id, "userId": &user.id })
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": "Project not found" }));
        }
        Err(e) => {
            error!("Error fetching project: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    }

    // Collect the project's task ids so their attachments can be cleaned up.
    let tasks_coll = data.mongodb.db.collection::<Task>("tasks");
    let mut cursor = match tasks_coll.find(doc! { "projectId": &project_id }).await {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error fetching project tasks: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };
    let mut task_ids = Vec::new();
    while let Some(result) = cursor.next().await {
        match result {
            Ok(task) => task_ids.push(task.task_id),
            Err(e) => {
                error!("Error reading project tasks: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }

    if let Err(e) = attachments::remove_attachments_for_tasks(&data, &task_ids).await {
        error!("Error removing project attachments: {}", e);
        return HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": e.to_string() }));
    }

    if let Err(e) = tasks_coll.delete_many(doc! { "projectId": &project_id }).await {
        error!("Error deleting project tasks: {}", e);
        return HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": e.to_string() }));
    }

    match projects_coll
        .delete_one(doc! { "projectId": &project_id, "userId": &user.id })
        .await
    {
        Ok(res) if res.deleted_count == 1 => {
            info!("Project deleted: {}", project_id);
            HttpResponse::Ok().json(serde_json::json!({ "message": "Project deleted" }))
        }
        Ok(_) => HttpResponse::NotFound().json(serde_json::json!({ "error": "Project not found" })),
        Err(e) => {
            error!("Error deleting project: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_status_uses_lowercase_wire_names() {
        assert_eq!(serde_json::to_string(&ProjectStatus::Pending).unwrap(), "\"pending\"");
        let parsed: ProjectStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(parsed, ProjectStatus::Completed);
    }

    #[test]
    fn project_json_defaults_flags_off() {
        let json = r#"{
            "projectId": "p1",
            "userId": "u1",
            "title": "Launch",
            "status": "active",
            "createdAt": "2026-01-05T00:00:00Z"
        }"#;
        let project: Project = serde_json::from_str(json).unwrap();
        assert!(!project.pinned);
        assert!(!project.archived);
        assert_eq!(project.color, None);
        assert!(project.assignees.is_empty());
    }
}
