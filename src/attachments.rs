use std::path::Path;

use actix_files::NamedFile;
use actix_multipart::Multipart;
use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use futures_util::StreamExt;
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use log::{error, info, warn};

use crate::app_state::AppState;
use crate::auth::current_user;
use crate::settings::SiteSettings;
use crate::tasks::Task;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub attachment_id: String,
    pub task_id: String,
    pub user_id: String,
    /// Server-generated storage name inside the upload directory.
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size: i64,
    pub created_at: chrono::DateTime<Utc>,
}

/// Multipart filenames arrive as raw bytes read through Latin-1, so a
/// UTF-8 original name shows up with every byte widened to one char.
/// Narrowing the chars back and re-reading as UTF-8 recovers it.
pub fn decode_mangled_filename(raw: &str) -> String {
    if raw.chars().all(|c| (c as u32) <= 0xFF) {
        let bytes: Vec<u8> = raw.chars().map(|c| c as u8).collect();
        if let Ok(decoded) = String::from_utf8(bytes) {
            return decoded;
        }
    }
    raw.to_string()
}

/// Dot-prefixed, lowercased extension, or empty when the name has none.
pub fn file_extension(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_lowercase(),
        _ => String::new(),
    }
}

pub fn is_allowed_extension(ext: &str, allowed: &[String]) -> bool {
    !ext.is_empty() && allowed.iter().any(|a| a == ext)
}

/// Removes attachment rows and stored files for the given tasks. Used by
/// task/project deletion and replace-mode import.
pub async fn remove_attachments_for_tasks(
    data: &AppState,
    task_ids: &[String],
) -> mongodb::error::Result<()> {
    if task_ids.is_empty() {
        return Ok(());
    }
    let attachments_coll = data.mongodb.db.collection::<Attachment>("attachments");
    let filter = doc! { "taskId": { "$in": task_ids } };

    let mut cursor = attachments_coll.find(filter.clone()).await?;
    while let Some(result) = cursor.next().await {
        let attachment = result?;
        let path = Path::new(&data.config.upload_dir).join(&attachment.filename);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Could not remove stored file {}: {}", path.display(), e);
        }
    }

    attachments_coll.delete_many(filter).await?;
    Ok(())
}

/// POST /api/attachments/task/{task_id}
/// Multipart field `file`. The extension allow-list and the size cap are
/// enforced before any attachment row is persisted.
pub async fn upload_attachment(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    mut payload: Multipart,
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

    let settings = match SiteSettings::load(&data.mongodb.db).await {
        Ok(settings) => settings,
        Err(e) => {
            error!("Error loading settings: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };
    let allowed = settings.allowed_extensions();
    let max_bytes = settings.max_upload_bytes();

    if let Err(e) = tokio::fs::create_dir_all(&data.config.upload_dir).await {
        error!("Error creating upload dir: {}", e);
        return HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": e.to_string() }));
    }

    while let Some(item) = payload.next().await {
        let mut field = match item {
            Ok(field) => field,
            Err(e) => {
                return HttpResponse::BadRequest()
                    .json(serde_json::json!({ "error": format!("Malformed upload: {}", e) }));
            }
        };
        if field.name() != "file" {
            continue;
        }

        let raw_name = match field.content_disposition().get_filename() {
            Some(name) => name.to_string(),
            None => {
                return HttpResponse::BadRequest()
                    .json(serde_json::json!({ "error": "No file provided" }));
            }
        };
        let original_name = decode_mangled_filename(&raw_name);
        let ext = file_extension(&original_name);
        if !is_allowed_extension(&ext, &allowed) {
            return HttpResponse::BadRequest().json(serde_json::json!({
                "error": format!("File type not allowed: {}", ext)
            }));
        }
        let mime_type = field
            .content_type()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let storage_name = format!("{}{}", Uuid::new_v4(), ext);
        let file_path = Path::new(&data.config.upload_dir).join(&storage_name);
        let mut file = match tokio::fs::File::create(&file_path).await {
            Ok(file) => file,
            Err(e) => {
                error!("Error creating file: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        };

        let mut size: usize = 0;
        while let Some(chunk) = field.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&file_path).await;
                    return HttpResponse::BadRequest()
                        .json(serde_json::json!({ "error": format!("Upload failed: {}", e) }));
                }
            };
            size += bytes.len();
            if size > max_bytes {
                let _ = tokio::fs::remove_file(&file_path).await;
                return HttpResponse::BadRequest().json(serde_json::json!({
                    "error": format!("File exceeds the {} MB limit", settings.max_file_size)
                }));
            }
            if let Err(e) = file.write_all(&bytes).await {
                let _ = tokio::fs::remove_file(&file_path).await;
                error!("Error writing file: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
        if let Err(e) = file.flush().await {
            let _ = tokio::fs::remove_file(&file_path).await;
            error!("Error flushing file: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }

        let attachment = Attachment {
            attachment_id: Uuid::new_v4().to_string(),
            task_id: task_id.clone(),
            user_id: user.id.clone(),
            filename: storage_name,
            original_name,
            mime_type,
            size: size as i64,
            created_at: Utc::now(),
        };

        let attachments_coll = data.mongodb.db.collection::<Attachment>("attachments");
        return match attachments_coll.insert_one(&attachment).await {
            Ok(_) => {
                info!("Attachment uploaded: {}", attachment.attachment_id);
                HttpResponse::Ok().json(&attachment)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&file_path).await;
                error!("Error inserting attachment: {}", e);
                HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }))
            }
        };
    }

    HttpResponse::BadRequest().json(serde_json::json!({ "error": "No file provided" }))
}

/// GET /api/attachments/task/{task_id}
pub async fn list_attachments(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    let task_id = path.into_inner();

    let attachments_coll = data.mongodb.db.collection::<Attachment>("attachments");
    let mut cursor = match attachments_coll
        .find(doc! { "taskId": &task_id, "userId": &user.id })
        .sort(doc! { "createdAt": -1 })
        .await
    {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error fetching attachments: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let mut attachments = Vec::new();
    while let Some(result) = cursor.next().await {
        match result {
            Ok(attachment) => attachments.push(attachment),
            Err(e) => {
                error!("Error reading attachments: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }
    HttpResponse::Ok().json(attachments)
}

/// GET /api/attachments/download/{id}
pub async fn download_attachment(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    let attachment_id = path.into_inner();

    let attachments_coll = data.mongodb.db.collection::<Attachment>("attachments");
    let attachment = match attachments_coll
        .find_one(doc! { "attachmentId": &attachment_id, "userId": &user.id })
        .await
    {
        Ok(Some(attachment)) => attachment,
        Ok(None) => {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": "Attachment not found" }));
        }
        Err(e) => {
            error!("Error fetching attachment: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let file_path = Path::new(&data.config.upload_dir).join(&attachment.filename);
    match NamedFile::open_async(&file_path).await {
        Ok(file) => file
            .set_content_disposition(ContentDisposition {
                disposition: DispositionType::Attachment,
                parameters: vec![DispositionParam::Filename(attachment.original_name.clone())],
            })
            .into_response(&req),
        Err(e) => {
            error!("Stored file missing for {}: {}", attachment.attachment_id, e);
            HttpResponse::NotFound().json(serde_json::json!({ "error": "File not found" }))
        }
    }
}

/// DELETE /api/attachments/{id}
pub async fn delete_attachment(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    let attachment_id = path.into_inner();

    let attachments_coll = data.mongodb.db.collection::<Attachment>("attachments");
    let attachment = match attachments_coll
        .find_one(doc! { "attachmentId": &attachment_id, "userId": &user.id })
        .await
    {
        Ok(Some(attachment)) => attachment,
        Ok(None) => {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": "Attachment not found" }));
        }
        Err(e) => {
            error!("Error fetching attachment: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let file_path = Path::new(&data.config.upload_dir).join(&attachment.filename);
    if let Err(e) = tokio::fs::remove_file(&file_path).await {
        warn!("Could not remove stored file {}: {}", file_path.display(), e);
    }

    match attachments_coll
        .delete_one(doc! { "attachmentId": &attachment_id, "userId": &user.id })
        .await
    {
        Ok(res) if res.deleted_count == 1 => {
            info!("Attachment deleted: {}", attachment_id);
            HttpResponse::Ok().json(serde_json::json!({ "message": "Attachment deleted" }))
        }
        Ok(_) => {
            HttpResponse::NotFound().json(serde_json::json!({ "error": "Attachment not found" }))
        }
        Err(e) => {
            error!("Error deleting attachment: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_utf8_filename_from_latin1_mangling() {
        let original = "项目计划.pdf";
        let mangled: String = original.bytes().map(|b| b as char).collect();
        assert_eq!(decode_mangled_filename(&mangled), original);
    }

    #[test]
    fn plain_ascii_filename_passes_through() {
        assert_eq!(decode_mangled_filename("report-v2.docx"), "report-v2.docx");
    }

    #[test]
    fn non_latin1_input_is_left_alone() {
        // Already proper UTF-8 with chars above U+00FF; not a mangled name.
        assert_eq!(decode_mangled_filename("图表.png"), "图表.png");
    }

    #[test]
    fn extension_is_dot_prefixed_and_lowercased() {
        assert_eq!(file_extension("Photo.JPG"), ".jpg");
        assert_eq!(file_extension("archive.tar.gz"), ".gz");
        assert_eq!(file_extension("noext"), "");
        assert_eq!(file_extension(".hidden"), "");
    }

    #[test]
    fn allow_list_rejects_unlisted_and_empty_extensions() {
        let allowed = vec![".pdf".to_string(), ".png".to_string()];
        assert!(is_allowed_extension(".pdf", &allowed));
        assert!(!is_allowed_extension(".exe", &allowed));
        assert!(!is_allowed_extension("", &allowed));
    }
}
