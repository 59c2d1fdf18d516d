// src/main.rs

mod ai;
mod app_state;
mod attachments;
mod auth;
mod backup;
mod channels;
mod config;
mod db;
mod projects;
mod settings;
mod tasks;
mod users;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use actix_cors::Cors;
use actix_files::Files;
use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{fn_service, Service, ServiceRequest, ServiceResponse, Transform},
    http,
    middleware::Logger,
    web, App, Error, HttpMessage, HttpResponse, HttpServer,
};
use env_logger::Env;
use futures_util::future::{ok, Ready};
use log::{error, info};

use crate::app_state::AppState;
use crate::auth::{validate_jwt, AuthUser};

#[derive(Debug, Clone)]
pub struct Authentication {
    secret: String,
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware {
            service,
            secret: self.secret.clone(),
        })
    }
}

pub struct AuthMiddleware<S> {
    service: S,
    secret: String,
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // Extract "Bearer <token>" from the Authorization header if present.
        // A valid token attaches an AuthUser; handlers that need one answer
        // 401 themselves when it is missing.
        if let Some(auth_header) = req.headers().get(http::header::AUTHORIZATION) {
            if let Ok(auth_str) = auth_header.to_str() {
                if auth_str.starts_with("Bearer ") {
                    let token = auth_str.trim_start_matches("Bearer ").trim();
                    match validate_jwt(token, &self.secret) {
                        Ok(claims) => {
                            req.extensions_mut().insert(AuthUser {
                                id: claims.sub,
                                role: claims.role,
                            });
                        }
                        Err(e) => {
                            let (req_parts, _payload) = req.into_parts();
                            let resp = HttpResponse::Unauthorized()
                                .json(serde_json::json!({
                                    "error": format!("Invalid token: {}", e)
                                }))
                                .map_into_boxed_body();
                            let srv_resp = ServiceResponse::new(req_parts, resp);
                            return Box::pin(async move { Ok(srv_resp) });
                        }
                    }
                }
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = config::Config::from_env();
    let mongodb = match db::MongoDB::init(&config.mongo_uri, &config.database_name).await {
        Ok(mongodb) => Arc::new(mongodb),
        Err(e) => {
            error!("Failed to set up MongoDB client: {}", e);
            std::process::exit(1);
        }
    };
    // One attempt per AI call, but never let a stalled provider hang a
    // worker indefinitely.
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .expect("Failed to build HTTP client");

    let bind_addr = ("0.0.0.0", config.port);
    info!("Server running at http://{}:{}", bind_addr.0, bind_addr.1);
    info!("Allowed CORS origin: {}", config.frontend_origin);

    let server_config = config.clone();
    HttpServer::new(move || {
        let config = server_config.clone();
        let cors = Cors::default()
            .allowed_origin(&config.frontend_origin)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .supports_credentials()
            .max_age(3600);

        let mut app = App::new()
            .wrap(Logger::default())
            .wrap(cors)
            .wrap(Authentication {
                secret: config.jwt_secret.clone(),
            })
            .app_data(web::Data::new(AppState {
                mongodb: mongodb.clone(),
                config: config.clone(),
                http_client: http_client.clone(),
            }))
            .service(
                web::scope("/api")
                    .service(
                        web::scope("/auth")
                            .route("/has-users", web::get().to(auth::has_users))
                            .route("/register", web::post().to(auth::register))
                            .route("/login", web::post().to(auth::login)),
                    )
                    .service(
                        web::scope("/users")
                            .route("", web::get().to(users::list_users))
                            .route("", web::post().to(users::create_user))
                            .route("/{id}/role", web::put().to(users::update_user_role))
                            .route("/{id}", web::put().to(users::update_user))
                            .route("/{id}", web::delete().to(users::delete_user)),
                    )
                    .service(
                        web::scope("/projects")
                            .route("", web::get().to(projects::list_projects))
                            .route("", web::post().to(projects::create_project))
                            .route("/{id}", web::put().to(projects::update_project))
                            .route("/{id}", web::delete().to(projects::delete_project)),
                    )
                    .service(
                        web::scope("/tasks")
                            .route("", web::get().to(tasks::list_tasks))
                            .route("", web::post().to(tasks::create_task))
                            .route(
                                "/project/{project_id}",
                                web::get().to(tasks::list_project_tasks),
                            )
                            .route("/{id}", web::put().to(tasks::update_task))
                            .route("/{id}", web::delete().to(tasks::delete_task)),
                    )
                    .service(
                        web::scope("/settings")
                            .route("/public", web::get().to(settings::get_public_settings))
                            .route("", web::get().to(settings::get_settings))
                            .route("", web::put().to(settings::update_settings)),
                    )
                    .service(
                        web::scope("/channels")
                            .route("/all-models", web::get().to(channels::all_models))
                            .route("/default", web::get().to(channels::default_model))
                            .route("", web::get().to(channels::list_channels))
                            .route("", web::post().to(channels::create_channel))
                            .route("/{id}/fetch-models", web::post().to(channels::fetch_models))
                            .route("/{id}", web::put().to(channels::update_channel))
                            .route("/{id}", web::delete().to(channels::delete_channel)),
                    )
                    .service(
                        web::scope("/attachments")
                            .route(
                                "/task/{task_id}",
                                web::post().to(attachments::upload_attachment),
                            )
                            .route(
                                "/task/{task_id}",
                                web::get().to(attachments::list_attachments),
                            )
                            .route(
                                "/download/{id}",
                                web::get().to(attachments::download_attachment),
                            )
                            .route("/{id}", web::delete().to(attachments::delete_attachment)),
                    )
                    .service(web::scope("/ai").route("/chat", web::post().to(ai::chat)))
                    .service(
                        web::scope("/backup")
                            .route("/export", web::get().to(backup::export_backup))
                            .route("/import", web::post().to(backup::import_backup)),
                    ),
            );

        // Production mode: serve the built frontend. Unknown paths fall
        // through to index.html so client-side routing keeps working.
        if let Some(static_dir) = config.static_dir.clone() {
            let index_path = format!("{}/index.html", static_dir);
            app = app.service(
                Files::new("/", &static_dir)
                    .index_file("index.html")
                    .default_handler(fn_service(move |req: ServiceRequest| {
                        let index_path = index_path.clone();
                        async move {
                            let (req, _) = req.into_parts();
                            let file = actix_files::NamedFile::open_async(&index_path).await?;
                            let res = file.into_response(&req);
                            Ok(ServiceResponse::new(req, res))
                        }
                    })),
            );
        }

        app
    })
    .bind(bind_addr)?
    .run()
    .await
}
