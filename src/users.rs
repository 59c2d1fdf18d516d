use actix_web::{web, HttpRequest, HttpResponse, Responder};
use bcrypt::{hash, DEFAULT_COST};
use chrono::Utc;
use futures_util::StreamExt;
use mongodb::bson::doc;
use serde::Deserialize;
use uuid::Uuid;
use log::{error, info};

use crate::app_state::AppState;
use crate::auth::{current_user, AuthUser, Role, User, UserView};

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub email: String,
    pub role: Option<Role>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoleRequest {
    pub role: Role,
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

/// GET /api/users (admin)
pub async fn list_users(req: HttpRequest, data: web::Data<AppState>) -> impl Responder {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }

    let users_coll = data.mongodb.db.collection::<User>("users");
    let mut cursor = match users_coll.find(doc! {}).await {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("Error fetching users: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let mut users: Vec<UserView> = Vec::new();
    while let Some(result) = cursor.next().await {
        match result {
            Ok(user) => users.push(UserView::from(&user)),
            Err(e) => {
                error!("Error reading users: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }
    HttpResponse::Ok().json(users)
}

/// POST /api/users (admin)
pub async fn create_user(
    req: HttpRequest,
    data: web::Data<AppState>,
    payload: web::Json<CreateUserRequest>,
) -> impl Responder {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }

    if payload.username.trim().is_empty()
        || payload.password.is_empty()
        || payload.email.trim().is_empty()
    {
        return HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "All fields are required" }));
    }
    if payload.password.len() < MIN_PASSWORD_LEN {
        return HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "Password must be at least 6 characters" }));
    }

    let users_coll = data.mongodb.db.collection::<User>("users");
    match users_coll
        .find_one(doc! { "$or": [
            { "username": &payload.username },
            { "email": &payload.email },
        ]})
        .await
    {
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
        role: payload.role.unwrap_or(Role::User),
        created_at: Utc::now(),
    };

    match users_coll.insert_one(&new_user).await {
        Ok(_) => {
            info!("User created: {}", new_user.user_id);
            HttpResponse::Ok().json(serde_json::json!({
                "message": "User created",
                "user": UserView::from(&new_user),
            }))
        }
        Err(e) => {
            error!("Error inserting user: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// PUT /api/users/{id} (admin)
pub async fn update_user(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateUserRequest>,
) -> impl Responder {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }
    let user_id = path.into_inner();

    let users_coll = data.mongodb.db.collection::<User>("users");
    let existing = match users_coll.find_one(doc! { "userId": &user_id }).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return HttpResponse::NotFound().json(serde_json::json!({ "error": "User not found" }));
        }
        Err(e) => {
            error!("Error fetching user: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    // Uniqueness checks exclude the user being edited. A failed lookup must
    // not read as "name is free".
    if let Some(username) = &payload.username {
        if username != &existing.username {
            match users_coll
                .find_one(doc! { "username": username, "userId": { "$ne": &user_id } })
                .await
            {
                Ok(Some(_)) => {
                    return HttpResponse::BadRequest()
                        .json(serde_json::json!({ "error": "Username already taken" }));
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Error checking duplicates: {}", e);
                    return HttpResponse::InternalServerError()
                        .json(serde_json::json!({ "error": e.to_string() }));
                }
            }
        }
    }
    if let Some(email) = &payload.email {
        if email != &existing.email {
            match users_coll
                .find_one(doc! { "email": email, "userId": { "$ne": &user_id } })
                .await
            {
                Ok(Some(_)) => {
                    return HttpResponse::BadRequest()
                        .json(serde_json::json!({ "error": "Email already taken" }));
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Error checking duplicates: {}", e);
                    return HttpResponse::InternalServerError()
                        .json(serde_json::json!({ "error": e.to_string() }));
                }
            }
        }
    }

    let mut set_doc = doc! {};
    if let Some(username) = &payload.username {
        if !username.trim().is_empty() {
            set_doc.insert("username", username.trim());
        }
    }
    if let Some(email) = &payload.email {
        if !email.trim().is_empty() {
            set_doc.insert("email", email.trim());
        }
    }
    if let Some(password) = &payload.password {
        if password.len() >= MIN_PASSWORD_LEN {
            match hash(password, DEFAULT_COST) {
                Ok(h) => {
                    set_doc.insert("password", h);
                }
                Err(e) => {
                    error!("Error hashing password: {}", e);
                    return HttpResponse::InternalServerError()
                        .json(serde_json::json!({ "error": "Error hashing password" }));
                }
            }
        }
    }
    if let Some(role) = &payload.role {
        match mongodb::bson::to_bson(role) {
            Ok(b) => {
                set_doc.insert("role", b);
            }
            Err(e) => {
                error!("Error serializing role: {}", e);
                return HttpResponse::InternalServerError()
                    .json(serde_json::json!({ "error": e.to_string() }));
            }
        }
    }

    if set_doc.is_empty() {
        return HttpResponse::Ok().json(serde_json::json!({ "message": "Nothing to update" }));
    }

    match users_coll
        .update_one(doc! { "userId": &user_id }, doc! { "$set": set_doc })
        .await
    {
        Ok(_) => HttpResponse::Ok().json(serde_json::json!({ "message": "User updated" })),
        Err(e) => {
            error!("Error updating user: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// PUT /api/users/{id}/role (admin)
pub async fn update_user_role(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateRoleRequest>,
) -> impl Responder {
    if let Err(resp) = require_admin(&req) {
        return resp;
    }
    let user_id = path.into_inner();

    let role_bson = match mongodb::bson::to_bson(&payload.role) {
        Ok(b) => b,
        Err(e) => {
            error!("Error serializing role: {}", e);
            return HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": e.to_string() }));
        }
    };

    let users_coll = data.mongodb.db.collection::<User>("users");
    match users_coll
        .update_one(doc! { "userId": &user_id }, doc! { "$set": { "role": role_bson } })
        .await
    {
        Ok(res) if res.matched_count == 1 => {
            HttpResponse::Ok().json(serde_json::json!({ "message": "Role updated" }))
        }
        Ok(_) => HttpResponse::NotFound().json(serde_json::json!({ "error": "User not found" })),
        Err(e) => {
            error!("Error updating role: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}

/// DELETE /api/users/{id} (admin)
pub async fn delete_user(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    let admin = match require_admin(&req) {
        Ok(user) => user,
        Err(resp) => return resp,
    };
    let user_id = path.into_inner();

    if user_id == admin.id {
        return HttpResponse::BadRequest()
            .json(serde_json::json!({ "error": "Cannot delete your own account" }));
    }

    let users_coll = data.mongodb.db.collection::<User>("users");
    match users_coll.delete_one(doc! { "userId": &user_id }).await {
        Ok(res) if res.deleted_count == 1 => {
            info!("User deleted: {}", user_id);
            HttpResponse::Ok().json(serde_json::json!({ "message": "User deleted" }))
        }
        Ok(_) => HttpResponse::NotFound().json(serde_json::json!({ "error": "User not found" })),
        Err(e) => {
            error!("Error deleting user: {}", e);
            HttpResponse::InternalServerError().json(serde_json::json!({ "error": e.to_string() }))
        }
    }
}
