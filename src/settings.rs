use actix_web::{web, HttpRequest, HttpResponse, Responder};
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use log::error;

use crate::app_state::AppState;
use crate::auth::{current_user, Role};

pub const DEFAULT_SITE_NAME: &str = "FlowBoard";
pub const DEFAULT_ALLOWED_FILE_TYPES: &str =
    ".pdf,.doc,.docx,.xls,.xlsx,.png,.jpg,.jpeg,.gif,.zip";

/// Singleton site settings, upserted under settingsId = 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteSettings {
    pub settings_id: i32,
    pub site_name: String,
    pub allow_registration: bool,
    pub default_role: Role,
    /// "channelId:modelId" reference into the AI channels, or empty.
    pub default_model: String,
    /// Comma-separated, dot-prefixed extensions.
    pub allowed_file_types: String,
    /// Upload cap in megabytes.
    pub max_file_size: u32,
}

impl Default for SiteSettings {
    fn default() -> Self {
        SiteSettings {
            settings_id: 1,
            site_name: DEFAULT_SITE_NAME.to_string(),
            allow_registration: true,
            default_role: Role::User,
            default_model: String::new(),
            allowed_file_types: DEFAULT_ALLOWED_FILE_TYPES.to_string(),
            max_file_size: 10,
        }
    }
}

impl SiteSettings {
    pub async fn load(db: &mongodb::Database) -> mongodb::error::Result<SiteSettings> {
        let coll = db.collection::<SiteSettings>("settings");
        Ok(coll
            .find_one(doc! { "settingsId": 1 })
            .await?
            .unwrap_or_default())
    }

    pub fn allowed_extensions(&self) -> Vec<String> {
        self.allowed_file_types
            .split(',')
            .map(|ext| ext.trim().to_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect()
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_file_size as usize * 1024 * 1024
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSettingsRequest {
    pub site_name: Option<String>,
    pub allow_registration: Option<bool>,
    pub default_role: Option<Role>,
    pub default_model: Option<String>,
    pub allowed_file_types: Option<String>,
    pub max_file_size: Option<u32>,
}

/// GET /api/settings/public
/// Unauthenticated. Only exposes the site name for the login page.
pub async fn get_public_settings(data: web::Data<AppState>) -> impl Responder {
    let site_name = match SiteSettings::load(&data.mongodb.db).await {
        Ok(settings) => settings.site_name,
        Err(e) => {
            error!("Error loading settings: {}", e);
            DEFAULT_SITE_NAME.to_string()
        }
    };
    HttpResponse::Ok().json(serde_json::json!({ "siteName": site_name }))
}

/// GET /api/settings (admin)
pub async fn get_settings(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    if !user.is_admin() {
        return HttpResponse::Forbidden().json(serde_json::json!({ "error": "Admin access required" }));
    }

    match SiteSettings::load(&data.mongodb.db).await {
        Ok(settings) => HttpResponse::Ok().json(settings),
        Err(e) => {
            error!("Error loading settings: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// PUT /api/settings (admin)
pub async fn update_settings(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<UpdateSettingsRequest>,
) -> impl Responder {
    let user = match current_user(&req) {
        Some(u) => u,
        None => return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" })),
    };
    if !user.is_admin() {
        return HttpResponse::Forbidden().json(serde_json::json!({ "error": "Admin access required" }));
    }

    let mut settings = match SiteSettings::load(&data.mongodb.db).await {
        Ok(settings) => settings,
        Err(e) => {
            error!("Error loading settings: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let payload = payload.into_inner();
    if let Some(site_name) = payload.site_name {
        settings.site_name = site_name;
    }
    if let Some(allow_registration) = payload.allow_registration {
        settings.allow_registration = allow_registration;
    }
    if let Some(default_role) = payload.default_role {
        settings.default_role = default_role;
    }
    if let Some(default_model) = payload.default_model {
        settings.default_model = default_model;
    }
    if let Some(allowed_file_types) = payload.allowed_file_types {
        settings.allowed_file_types = allowed_file_types;
    }
    if let Some(max_file_size) = payload.max_file_size {
        settings.max_file_size = max_file_size;
    }

    let coll = data.mongodb.db.collection::<SiteSettings>("settings");
    match coll
        .replace_one(doc! { "settingsId": 1 }, &settings)
        .upsert(true)
        .await
    {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "message": "Settings updated" })),
        Err(e) => {
            error!("Error saving settings: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_extensions_are_trimmed_and_lowercased() {
        let settings = SiteSettings {
            allowed_file_types: ".PDF, .docx ,.PNG,,".to_string(),
            ..SiteSettings::default()
        };
        assert_eq!(settings.allowed_extensions(), vec![".pdf", ".docx", ".png"]);
    }

    #[test]
    fn default_settings_allow_registration_with_user_role() {
        let settings = SiteSettings::default();
        assert!(settings.allow_registration);
        assert_eq!(settings.default_role, Role::User);
        assert_eq!(settings.max_upload_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn settings_round_trip_uses_camel_case_keys() {
        let json = serde_json::to_value(SiteSettings::default()).unwrap();
        assert!(json.get("siteName").is_some());
        assert!(json.get("allowRegistration").is_some());
        assert!(json.get("maxFileSize").is_some());
    }
}
