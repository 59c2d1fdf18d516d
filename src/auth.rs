use actix_web::{web, HttpMessage, HttpRequest, HttpResponse, Responder};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use log::error;

use crate::app_state::AppState;
use crate::settings::SiteSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize,
}

/// Identity decoded from the bearer token, inserted into request
/// extensions by the authentication middleware.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub username: String,
    pub password: String,
    pub email: String,
    pub role: Role,
    pub created_at: chrono::DateTime<Utc>,
}

/// Public projection of a user. Never carries the password hash.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub created_at: chrono::DateTime<Utc>,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        UserView {
            id: user.user_id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            role: user.role,
            created_at: user.created_at,
        }
    }
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    pub email: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub fn create_jwt(user_id: &str, role: Role, secret: &str) -> String {
    let expiration = Utc::now() + Duration::days(7);
    let claims = Claims {
        sub: user_id.to_string(),
        role,
        exp: expiration.timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref())).unwrap()
}

pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

pub fn current_user(req: &HttpRequest) -> Option<AuthUser> {
    req.extensions().get::<AuthUser>().cloned()
}

/// The very first account becomes the administrator; everyone after that
/// gets whatever the site settings hand out.
pub fn role_for_registration(existing_users: u64, default_role: Role) -> Role {
    if existing_users == 0 {
        Role::Admin
    } else {
        default_role
    }
}

/// GET /api/auth/has-users
/// Public. Lets the frontend decide whether to show the first-run banner.
pub async fn has_users(data: web::Data<AppState>) -> impl Responder {
    let users = data.mongodb.db.collection::<User>("users");
    match users.count_documents(doc! {}).await {
        Ok(count) => HttpResponse::Ok().json(serde_json::json!({ "hasUsers": count > 0 })),
        Err(e) => {
            error!("Error counting users: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// POST /api/auth/register
pub async fn register(
    data: web::Data<AppState>,
    payload: web::Json<RegisterRequest>,
) -> impl Responder {
    if payload.username.trim().is_empty()
        || payload.password.is_empty()
        || payload.email.trim().is_empty()
    {
        return HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "All fields are required" }));
    }

    let users = data.mongodb.db.collection::<User>("users");
    let user_count = match users.count_documents(doc! {}).await {
        Ok(count) => count,
        Err(e) => {
            error!("Error counting users: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let settings = match SiteSettings::load(&data.mongodb.db).await {
        Ok(s) => s,
        Err(e) => {
            error!("Error loading settings: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    if user_count > 0 && !settings.allow_registration {
        return HttpResponse::Forbidden()
            .json(serde_json::json!({ "error": "Registration is disabled" }));
    }

    // Username and email are both unique.
    let duplicate = users
        .find_one(doc! { "$or": [
            { "username": &payload.username },
            { "email": &payload.email },
        ]})
        .await;
    match duplicate {
        Ok(Some(_)) => {
            return HttpResponse::BadRequest()
                .json(serde_json::json!({ "error": "Username or email already taken" }));
        }
        Ok(None) => {}
        Err(e) => {
            error!("Error checking duplicates: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    }

    let hashed_password = match hash(&payload.password, DEFAULT_COST) {
        Ok(h) => h,
        Err(e) => {
            error!("Error hashing password: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": "Error hashing password" }));
        }
    };

    let new_user = User {
        user_id: Uuid::new_v4().to_string(),
        username: payload.username.trim().to_string(),
        password: hashed_password,
        email: payload.email.trim().to_string(),
        role: role_for_registration(user_count, settings.default_role),
        created_at: Utc::now(),
    };

    if let Err(e) = users.insert_one(&new_user).await {
        error!("Error inserting user: {}", e);
        return HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": e.to_string() }));
    }

    let token = create_jwt(&new_user.user_id, new_user.role, &data.config.jwt_secret);
    HttpResponse::Ok().json(serde_json::json!({
        "user": UserView::from(&new_user),
        "token": token,
    }))
}

/// POST /api/auth/login
pub async fn login(
    data: web::Data<AppState>,
    payload: web::Json<LoginRequest>,
) -> impl Responder {
    let users = data.mongodb.db.collection::<User>("users");
    let user = match users.find_one(doc! { "username": &payload.username }).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return HttpResponse::Unauthorized()
                .json(serde_json::json!({ "error": "Invalid username or password" }));
        }
        Err(e) => {
            error!("Error fetching user: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    if !verify(&payload.password, &user.password).unwrap_or(false) {
        return HttpResponse::Unauthorized()
            .json(serde_json::json!({ "error": "Invalid username or password" }));
    }

    let token = create_jwt(&user.user_id, user.role, &data.config.jwt_secret);
    HttpResponse::Ok().json(serde_json::json!({
        "user": UserView::from(&user),
        "token": token,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_round_trip_preserves_identity_and_role() {
        let token = create_jwt("user-42", Role::Admin, "test-secret");
        let claims = validate_jwt(&token, "test-secret").unwrap();
        assert_eq!(claims.sub, "user-42");
        assert_eq!(claims.role, Role::Admin);
    }

    #[test]
    fn jwt_rejects_wrong_secret() {
        let token = create_jwt("user-42", Role::User, "test-secret");
        assert!(validate_jwt(&token, "other-secret").is_err());
    }

    #[test]
    fn first_registration_is_admin() {
        assert_eq!(role_for_registration(0, Role::User), Role::Admin);
        assert_eq!(role_for_registration(0, Role::Admin), Role::Admin);
    }

    #[test]
    fn later_registrations_take_default_role() {
        assert_eq!(role_for_registration(1, Role::User), Role::User);
        assert_eq!(role_for_registration(7, Role::Admin), Role::Admin);
    }

    #[test]
    fn password_hash_verifies() {
        let hashed = hash("hunter22", 4).unwrap();
        assert!(verify("hunter22", &hashed).unwrap());
        assert!(!verify("hunter23", &hashed).unwrap());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }
}
