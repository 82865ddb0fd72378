use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use serde::Deserialize;
use serde_json::json;

use crate::broadcast::Broadcaster;
use crate::dispatcher::serve_connection;
use crate::error::AppError;
use crate::gpio::{Direction, LineBackend, PinManager};

pub struct AppState<B: LineBackend> {
    pub manager: Arc<PinManager<B>>,
    pub broadcaster: Arc<Broadcaster>,
}

impl<B: LineBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            broadcaster: Arc::clone(&self.broadcaster),
        }
    }
}

#[derive(Deserialize, Default)]
struct SetupQuery {
    direction: Option<String>,
}

#[derive(Deserialize)]
struct WritePayload {
    value: bool,
}

impl<B: LineBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        web::scope(base_path)
            .service(
                web::resource("/health")
                    .route(web::get().to(health))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/gpios")
                    .route(web::get().to(list_lines::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/ws/gpio")
                    .route(web::get().to(subscribe_ws::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/gpio/{line_id}/setup")
                    .route(web::post().to(setup_line::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/gpio/{line_id}/write")
                    .route(web::post().to(write_line::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::POST]))
                            .to(method_not_allowed),
                    ),
            )
            .service(
                web::resource("/gpio/{line_id}/read")
                    .route(web::get().to(read_line::<B>))
                    .route(
                        web::route()
                            .guard(guard_not_methods(&[Method::GET]))
                            .to(method_not_allowed),
                    ),
            )
    }
}

async fn health() -> impl Responder {
    web::Json(json!({ "status": "healthy", "service": "gpio" }))
}

async fn list_lines<B: LineBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let lines = state.manager.snapshot();

    Ok(web::Json(lines))
}

async fn setup_line<B: LineBackend + 'static>(
    req: HttpRequest,
    query: web::Query<SetupQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    let direction: Direction = query.direction.as_deref().unwrap_or("out").parse()?;

    state.manager.configure(line_id, direction)?;

    Ok(web::Json(json!({
        "status": "success",
        "message": "Line configured",
        "line_id": line_id,
        "direction": direction,
    })))
}

async fn write_line<B: LineBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;
    let value = parse_write_payload(&body)?;

    state.manager.write(line_id, value)?;

    Ok(web::Json(json!({
        "status": "success",
        "line_id": line_id,
        "value": value,
    })))
}

async fn read_line<B: LineBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, AppError> {
    let line_id = parse_line_id(&req)?;

    let value = state.manager.read(line_id)?;

    Ok(web::Json(json!({
        "status": "success",
        "line_id": line_id,
        "value": value,
    })))
}

async fn subscribe_ws<B: LineBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, client_stream) = actix_ws::handle(&req, stream)?;

    let subscriber = state.broadcaster.subscribe();
    let manager = state.manager.clone();
    let broadcaster = state.broadcaster.clone();
    actix_web::rt::spawn(async move {
        serve_connection(session, client_stream, manager, broadcaster, subscriber).await;
    });

    Ok(response)
}

fn parse_write_payload(body: &[u8]) -> Result<bool, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty value payload".into()));
    }

    let payload: WritePayload = serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid request body: {e}")))?;

    Ok(payload.value)
}

fn parse_line_id(req: &HttpRequest) -> Result<u32, AppError> {
    let line_id = req
        .match_info()
        .get("line_id")
        .ok_or_else(|| AppError::InvalidValue("Missing line id".into()))?;
    let line_id = line_id
        .parse::<u32>()
        .map_err(|_| AppError::InvalidValue("Invalid line id".into()))?;

    Ok(line_id)
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
