use actix_web::{web, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use futures_util::StreamExt;
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use log::{error, info};

use crate::app_state::AppState;
use crate::auth::{current_user, AuthUser};
use crate::settings::SiteSettings;

pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const MASKED_KEY: &str = "********";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    Gemini,
    Openai,
    OpenaiCompatible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

/// An admin-configured AI provider credential/endpoint set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub channel_id: String,
    pub name: String,
    pub channel_type: ChannelType,
    #[serde(default)]
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
    pub enabled: bool,
    pub created_at: chrono::DateTime<Utc>,
}

/// Admin-facing projection with the API key masked.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub channel_id: String,
    pub name: String,
    pub channel_type: ChannelType,
    pub base_url: String,
    pub api_key: String,
    pub models: Vec<ModelInfo>,
    pub enabled: bool,
    pub created_at: chrono::DateTime<Utc>,
}

impl From<&Channel> for ChannelView {
    fn from(channel: &Channel) -> Self {
        ChannelView {
            channel_id: channel.channel_id.clone(),
            name: channel.name.clone(),
            channel_type: channel.channel_type,
            base_url: channel.base_url.clone(),
            api_key: mask_api_key(&channel.api_key),
            models: channel.models.clone(),
            enabled: channel.enabled,
            created_at: channel.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelRequest {
    pub name: String,
    pub channel_type: ChannelType,
    pub base_url: Option<String>,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChannelRequest {
    pub name: Option<String>,
    pub channel_type: Option<ChannelType>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub models: Option<Vec<ModelInfo>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableModel {
    pub channel_id: String,
    pub channel_name: String,
    pub channel_type: ChannelType,
    pub model_id: String,
    pub model_name: String,
    pub full_id: String,
}

pub fn mask_api_key(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        MASKED_KEY.to_string()
    }
}

/// Splits a "channelId:modelId" settings reference.
pub fn parse_default_model(reference: &str) -> Option<(&str, &str)> {
    match reference.split_once(':') {
        Some((channel_id, model_id)) if !channel_id.is_empty() && !model_id.is_empty() => {
            Some((channel_id, model_id))
        }
        _ => None,
    }
}

pub fn effective_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        OPENAI_API_BASE.to_string()
    } else {
        trimmed.trim_end_matches('/').to_string()
    }
}

pub fn flatten_models(channels: &[Channel]) -> Vec<AvailableModel> {
    let mut all = Vec::new();
    for channel in channels {
        for model in &channel.models {
            all.push(AvailableModel {
                channel_id: channel.channel_id.clone(),
                channel_name: channel.name.clone(),
                channel_type: channel.channel_type,
                model_id: model.id.clone(),
                model_name: model.name.clone(),
                full_id: format!("{}:{}", channel.channel_id, model.id),
            });
        }
    }
    all
}

/// Resolves the settings' default model against the enabled channels.
pub async fn resolve_default_channel(
    db: &mongodb::Database,
    settings: &SiteSettings,
) -> mongodb::error::Result<Option<(Channel, String)>> {
    let (channel_id, model_id) = match parse_default_model(&settings.default_model) {
        Some(parts) => parts,
        None => return Ok(None),
    };
    let channels_coll = db.collection::<Channel>("ai_channels");
    let channel = channels_coll
        .find_one(doc! { "channelId": channel_id, "enabled": true })
        .await?;
    Ok(channel.map(|c| (c, model_id.to_string())))
}

fn require_admin(req: &HttpRequest) -> Result<AuthUser, HttpResponse> {
    let user = current_user(req).ok_or_else(|| {
        HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" }))
    })?;
    if !user.is_admin() {
        return Err(HttpResponse::Forbidden()
            .json(serde_json::json!({ "error": "Admin access required" })));
    }
    Ok(user)
}

/// GET /api/channels (admin)
pub async fn list_channels(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }

    let channels_coll = data.mongodb.db.collection::<Channel>("ai_channels");
    let mut cursor = match channels_coll
        .find(doc! {})
        .sort(doc! { "createdAt": -1 })
        .await
    {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error fetching channels: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let mut channels: Vec<ChannelView> = Vec::new();
    while let Some(result) = cursor.next().await {
        match result {
            Ok(channel) => channels.push(ChannelView::from(&channel)),
            Err(e) => {
                error!("Error reading channels: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }
    HttpResponse::Ok().json(channels)
}

/// POST /api/channels (admin)
pub async fn create_channel(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateChannelRequest>,
) -> impl Responder {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }

    if payload.name.trim().is_empty() || payload.api_key.trim().is_empty() {
        return HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "Name and API key are required" }));
    }

    let new_channel = Channel {
        channel_id: Uuid::new_v4().to_string(),
        name: payload.name.trim().to_string(),
        channel_type: payload.channel_type,
        base_url: payload.base_url.clone().unwrap_or_default(),
        api_key: payload.api_key.clone(),
        models: Vec::new(),
        enabled: true,
        created_at: Utc::now(),
    };

    let channels_coll = data.mongodb.db.collection::<Channel>("ai_channels");
    match channels_coll.insert_one(&new_channel).await {
        Ok(_) => {
            info!("Channel created: {}", new_channel.channel_id);
            HttpResponse::Ok().json(ChannelView::from(&new_channel))
        }
        Err(e) => {
            error!("Error inserting channel: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// PUT /api/channels/{id} (admin)
pub async fn update_channel(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateChannelRequest>,
) -> impl Responder {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }
    let channel_id = path.into_inner();

    let channels_coll = data.mongodb.db.collection::<Channel>("ai_channels");
    let mut channel = match channels_coll
        .find_one(doc! { "channelId": &channel_id })
        .await
    {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": "Channel not found" }));
        }
        Err(e) => {
            error!("Error fetching channel: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let payload = payload.into_inner();
    if let Some(name) = payload.name {
        if !name.trim().is_empty() {
            channel.name = name.trim().to_string();
        }
    }
    if let Some(channel_type) = payload.channel_type {
        channel.channel_type = channel_type;
    }
    if let Some(base_url) = payload.base_url {
        channel.base_url = base_url;
    }
    if let Some(api_key) = payload.api_key {
        // The UI round-trips the masked placeholder; keep the stored key.
        if api_key != MASKED_KEY && !api_key.is_empty() {
            channel.api_key = api_key;
        }
    }
    if let Some(models) = payload.models {
        channel.models = models;
    }
    if let Some(enabled) = payload.enabled {
        channel.enabled = enabled;
    }

    match channels_coll
        .replace_one(doc! { "channelId": &channel_id }, &channel)
        .await
    {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "message": "Channel updated" })),
        Err(e) => {
            error!("Error updating channel: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// DELETE /api/channels/{id} (admin)
pub async fn delete_channel(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }
    let channel_id = path.into_inner();

    let channels_coll = data.mongodb.db.collection::<Channel>("ai_channels");
    match channels_coll.delete_one(doc! { "channelId": &channel_id }).await {
        Ok(res) if res.deleted_count == 1 => {
            info!("Channel deleted: {}", channel_id);
            HttpResponse::Ok().json(serde_json::json!({ "message": "Channel deleted" }))
        }
        Ok(_) => HttpResponse::NotFound().json(serde_json::json!({ "error": "Channel not found" })),
        Err(e) => {
            error!("Error deleting channel: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProviderError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct GeminiModelsResponse {
    #[serde(default)]
    pub models: Vec<GeminiModel>,
    pub error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
pub struct GeminiModel {
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiModelsResponse {
    #[serde(default)]
    pub data: Vec<OpenAiModel>,
    pub error: Option<ProviderError>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAiModel {
    pub id: String,
}

pub fn map_gemini_models(response: GeminiModelsResponse) -> Vec<ModelInfo> {
    response
        .models
        .into_iter()
        .map(|m| {
            let id = m.name.strip_prefix("models/").unwrap_or(&m.name).to_string();
            let name = m.display_name.unwrap_or_else(|| id.clone());
            ModelInfo { id, name }
        })
        .collect()
}

pub fn map_openai_models(response: OpenAiModelsResponse) -> Vec<ModelInfo> {
    response
        .data
        .into_iter()
        .map(|m| ModelInfo { name: m.id.clone(), id: m.id })
        .collect()
}

/// POST /api/channels/{id}/fetch-models (admin)
/// Pulls the provider's model list and stores it on the channel.
pub async fn fetch_models(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }
    let channel_id = path.into_inner();

    let channels_coll = data.mongodb.db.collection::<Channel>("ai_channels");
    let channel = match channels_coll
        .find_one(doc! { "channelId": &channel_id })
        .await
    {
        Ok(Some(channel)) => channel,
        Ok(None) => {
            return HttpResponse::NotFound()
                .json(serde_json::json!({ "error": "Channel not found" }));
        }
        Err(e) => {
            error!("Error fetching channel: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let models = match channel.channel_type {
        ChannelType::Gemini => {
            let url = format!("{}/models?key={}", GEMINI_API_BASE, channel.api_key);
            let response = match data.http_client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    error!("Gemini models request failed: {}", e);
                    return HttpResponse::InternalServerError().json(serde_json::json!({
                        "error": format!("Failed to fetch models: {}", e)
                    }));
                }
            };
            let parsed: GeminiModelsResponse = match response.json().await {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!("Gemini models response parse error: {}", e);
                    return HttpResponse::InternalServerError().json(serde_json::json!({
                        "error": format!("Failed to fetch models: {}", e)
                    }));
                }
            };
            if let Some(provider_error) = parsed.error {
                return HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": format!("Failed to fetch models: {}", provider_error.message)
                }));
            }
            map_gemini_models(parsed)
        }
        ChannelType::Openai | ChannelType::OpenaiCompatible => {
            let url = format!("{}/models", effective_base_url(&channel.base_url));
            let response = match data
                .http_client
                .get(&url)
                .bearer_auth(&channel.api_key)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    error!("Model list request failed: {}", e);
                    return HttpResponse::InternalServerError().json(serde_json::json!({
                        "error": format!("Failed to fetch models: {}", e)
                    }));
                }
            };
            let parsed: OpenAiModelsResponse = match response.json().await {
                Ok(parsed) => parsed,
                Err(e) => {
                    error!("Model list response parse error: {}", e);
                    return HttpResponse::InternalServerError().json(serde_json::json!({
                        "error": format!("Failed to fetch models: {}", e)
                    }));
                }
            };
            if let Some(provider_error) = parsed.error {
                return HttpResponse::InternalServerError().json(serde_json::json!({
                    "error": format!("Failed to fetch models: {}", provider_error.message)
                }));
            }
            map_openai_models(parsed)
        }
    };

    let models_bson = match mongodb::bson::to_bson(&models) {
        Ok(b) => b,
        Err(e) => {
            error!("Error serializing models: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };
    if let Err(e) = channels_coll
        .update_one(
            doc! { "channelId": &channel_id },
            doc! { "$set": { "models": models_bson } },
        )
        .await
    {
        error!("Error storing models: {}", e);
        return HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": e.to_string() }));
    }

    info!("Fetched {} models for channel {}", models.len(), channel_id);
    HttpResponse::Ok().json(serde_json::json!({
        "models": models,
        "message": format!("Fetched {} models", models.len()),
    }))
}

/// GET /api/channels/all-models
/// Available to every authenticated user so they can pick a default model.
pub async fn all_models(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    if current_user(&req).is_none() {
        return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" }));
    }

    let channels_coll = data.mongodb.db.collection::<Channel>("ai_channels");
    let mut cursor = match channels_coll.find(doc! { "enabled": true }).await {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error fetching channels: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let mut channels = Vec::new();
    while let Some(result) = cursor.next().await {
        match result {
            Ok(channel) => channels.push(channel),
            Err(e) => {
                error!("Error reading channels: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }
    HttpResponse::Ok().json(flatten_models(&channels))
}

/// GET /api/channels/default
/// Reports whether a usable default model is configured. Provider calls run
/// server-side, so the API key is never exposed here.
pub async fn default_model(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    if current_user(&req).is_none() {
        return HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" }));
    }

    let settings = match SiteSettings::load(&data.mongodb.db).await {
        Ok(settings) => settings,
        Err(e) => {
            error!("Error loading settings: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    match resolve_default_channel(&data.mongodb.db, &settings).await {
        Ok(Some((channel, model_id))) => HttpResponse::Ok().json(serde_json::json!({
            "configured": true,
            "channelName": channel.name,
            "type": channel.channel_type,
            "model": model_id,
        })),
        Ok(None) => HttpResponse::Ok().json(serde_json::json!({ "configured": false })),
        Err(e) => {
            error!("Error resolving default channel: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_is_masked_only_when_set() {
        assert_eq!(mask_api_key("sk-123"), MASKED_KEY);
        assert_eq!(mask_api_key(""), "");
    }

    #[test]
    fn default_model_reference_parses() {
        assert_eq!(parse_default_model("ch-1:gpt-4o"), Some(("ch-1", "gpt-4o")));
        assert_eq!(parse_default_model(""), None);
        assert_eq!(parse_default_model("ch-1:"), None);
        assert_eq!(parse_default_model("nocolon"), None);
    }

    #[test]
    fn base_url_falls_back_to_openai_and_strips_trailing_slash() {
        assert_eq!(effective_base_url(""), OPENAI_API_BASE);
        assert_eq!(effective_base_url("  "), OPENAI_API_BASE);
        assert_eq!(effective_base_url("https://llm.local/v1/"), "https://llm.local/v1");
    }

    #[test]
    fn gemini_model_names_drop_the_models_prefix() {
        let parsed: GeminiModelsResponse = serde_json::from_str(
            r#"{ "models": [
                { "name": "models/gemini-pro", "displayName": "Gemini Pro" },
                { "name": "gemini-flash" }
            ]}"#,
        )
        .unwrap();
        let models = map_gemini_models(parsed);
        assert_eq!(models[0].id, "gemini-pro");
        assert_eq!(models[0].name, "Gemini Pro");
        assert_eq!(models[1].id, "gemini-flash");
        assert_eq!(models[1].name, "gemini-flash");
    }

    #[test]
    fn openai_models_use_id_as_name() {
        let parsed: OpenAiModelsResponse =
            serde_json::from_str(r#"{ "data": [ { "id": "gpt-4o-mini" } ] }"#).unwrap();
        let models = map_openai_models(parsed);
        assert_eq!(models[0].id, "gpt-4o-mini");
        assert_eq!(models[0].name, "gpt-4o-mini");
    }

    #[test]
    fn flattened_models_carry_channel_scoped_full_id() {
        let channel = Channel {
            channel_id: "ch-1".to_string(),
            name: "Main".to_string(),
            channel_type: ChannelType::OpenaiCompatible,
            base_url: String::new(),
            api_key: "k".to_string(),
            models: vec![ModelInfo { id: "m1".to_string(), name: "Model 1".to_string() }],
            enabled: true,
            created_at: Utc::now(),
        };
        let flat = flatten_models(&[channel]);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].full_id, "ch-1:m1");
    }

    #[test]
    fn channel_type_uses_kebab_case_wire_names() {
        assert_eq!(
            serde_json::to_string(&ChannelType::OpenaiCompatible).unwrap(),
            "\"openai-compatible\""
        );
        let parsed: ChannelType = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(parsed, ChannelType::Gemini);
    }
}
