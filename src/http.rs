use crate::db::{EventRecord, PhotoRecord, TagRecord};
use crate::path_guard::basename_of;
use crate::resolver::{RenditionKind, ResolveError, ResolvedResource};
use crate::routes::{Endpoint, HEALTHZ_PATH, RouteTable};
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get};
use axum::{Json, Router};
use image::ImageFormat;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::warn;

const FILE_CACHE_CONTROL: &str = "public, max-age=86400";

pub fn router(state: Arc<AppState>) -> Router {
    let app = state
        .routes
        .register(Router::new().route(HEALTHZ_PATH, get(healthz)), handler_for);
    app.with_state(state)
}

fn handler_for(endpoint: Endpoint) -> MethodRouter<Arc<AppState>> {
    match endpoint {
        Endpoint::Events => get(list_events),
        Endpoint::Event => get(show_event),
        Endpoint::Tags => get(list_tags),
        Endpoint::Tag => get(show_tag),
        Endpoint::Raw => get(raw_photo),
        Endpoint::Show => get(inline_photo),
        Endpoint::Thumb => get(thumb_photo),
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Serialize)]
struct EventView {
    id: i64,
    name: Option<String>,
    time_created: i64,
    url: String,
}

#[derive(Debug, Serialize)]
struct TagView {
    name: String,
    photo_count: usize,
    url: String,
}

#[derive(Debug, Serialize)]
struct PhotoView {
    id: i64,
    title: Option<String>,
    filesize: i64,
    basename: String,
    urls: PhotoUrls,
}

#[derive(Debug, Serialize)]
struct PhotoUrls {
    raw: String,
    show: String,
    thumb: String,
}

#[derive(Debug, Serialize)]
struct EventsResponse {
    events: Vec<EventView>,
}

#[derive(Debug, Serialize)]
struct EventResponse {
    event: EventView,
    photos: Vec<PhotoView>,
}

#[derive(Debug, Serialize)]
struct TagsResponse {
    tags: Vec<TagView>,
}

#[derive(Debug, Serialize)]
struct TagResponse {
    tag: TagView,
    photos: Vec<PhotoView>,
}

fn event_view(routes: &RouteTable, event: &EventRecord) -> EventView {
    let id = event.id.to_string();
    let slug = event
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .unwrap_or("untitled");
    EventView {
        id: event.id,
        name: event.name.clone(),
        time_created: event.time_created,
        url: routes.url_for(Endpoint::Event, &[("id", id.as_str()), ("name", slug)]),
    }
}

fn tag_view(routes: &RouteTable, tag: &TagRecord) -> TagView {
    TagView {
        name: tag.name.clone(),
        photo_count: tag.photo_ids.len(),
        url: routes.url_for(Endpoint::Tag, &[("name", tag.name.as_str())]),
    }
}

fn photo_view(routes: &RouteTable, photo: &PhotoRecord) -> PhotoView {
    let id = photo.id.to_string();
    let basename = basename_of(&photo.filename).unwrap_or_default();
    let params = [("id", id.as_str()), ("basename", basename)];
    PhotoView {
        id: photo.id,
        title: photo.title.clone(),
        filesize: photo.filesize,
        basename: basename.to_string(),
        urls: PhotoUrls {
            raw: routes.url_for(Endpoint::Raw, &params),
            show: routes.url_for(Endpoint::Show, &params),
            thumb: routes.url_for(Endpoint::Thumb, &params),
        },
    }
}

fn photo_views(routes: &RouteTable, photos: &[PhotoRecord]) -> Vec<PhotoView> {
    photos.iter().map(|photo| photo_view(routes, photo)).collect()
}

async fn list_events(
    State(state): State<Arc<AppState>>,
) -> Result<Json<EventsResponse>, ApiError> {
    let events = state.db.list_events().await?;
    Ok(Json(EventsResponse {
        events: events
            .iter()
            .map(|event| event_view(&state.routes, event))
            .collect(),
    }))
}

async fn show_event(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<EventResponse>, ApiError> {
    let id = parse_id(&params)?;
    let event = state
        .db
        .find_event_by_id(id)
        .await?
        .ok_or_else(ApiError::not_found)?;
    let photos = state.db.list_photos_by_event(event.id).await?;
    Ok(Json(EventResponse {
        event: event_view(&state.routes, &event),
        photos: photo_views(&state.routes, &photos),
    }))
}

async fn list_tags(State(state): State<Arc<AppState>>) -> Result<Json<TagsResponse>, ApiError> {
    let tags = state.db.list_tags().await?;
    Ok(Json(TagsResponse {
        tags: tags.iter().map(|tag| tag_view(&state.routes, tag)).collect(),
    }))
}

async fn show_tag(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Json<TagResponse>, ApiError> {
    let name = path_param(&params, "name")?;
    let tag = state
        .db
        .find_tag_by_name(name)
        .await?
        .ok_or_else(ApiError::not_found)?;
    let photos = state.db.list_photos_by_ids(&tag.photo_ids).await?;
    Ok(Json(TagResponse {
        tag: tag_view(&state.routes, &tag),
        photos: photo_views(&state.routes, &photos),
    }))
}

async fn raw_photo(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    serve_photo(&state, &params, RenditionKind::Raw).await
}

async fn inline_photo(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    serve_photo(&state, &params, RenditionKind::Inline).await
}

async fn thumb_photo(
    State(state): State<Arc<AppState>>,
    Path(params): Path<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    serve_photo(&state, &params, RenditionKind::Thumb).await
}

async fn serve_photo(
    state: &AppState,
    params: &HashMap<String, String>,
    kind: RenditionKind,
) -> Result<Response, ApiError> {
    let id = parse_id(params)?;
    let basename = path_param(params, "basename")?;
    let resolved = state.resolver.resolve(id, basename, kind).await?;
    file_response(&resolved).await
}

async fn file_response(resolved: &ResolvedResource) -> Result<Response, ApiError> {
    let file = match tokio::fs::File::open(&resolved.path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(error = ?err, path = %resolved.path.display(), "photo file open failed");
            return Err(ApiError::not_found());
        }
    };
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(resolved)),
    );
    if let Ok(metadata) = file.metadata().await {
        if let Ok(value) = HeaderValue::from_str(&metadata.len().to_string()) {
            headers.insert(header::CONTENT_LENGTH, value);
        }
    }
    let disposition = match resolved.kind {
        RenditionKind::Raw => "attachment",
        RenditionKind::Inline | RenditionKind::Thumb => "inline",
    };
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!(
            "{disposition}; filename=\"{}\"",
            sanitize_header_text(&resolved.download_name)
        ))
        .unwrap_or(HeaderValue::from_static(disposition)),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(FILE_CACHE_CONTROL),
    );
    headers.insert(
        "X-Rendition",
        HeaderValue::from_static(if resolved.rendered {
            "scaled"
        } else {
            "original"
        }),
    );
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

fn content_type_for(resolved: &ResolvedResource) -> &'static str {
    if resolved.rendered {
        return "image/jpeg";
    }
    ImageFormat::from_path(&resolved.path)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

fn path_param<'a>(params: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(ApiError::not_found)
}

fn parse_id(params: &HashMap<String, String>) -> Result<i64, ApiError> {
    path_param(params, "id")?
        .parse::<i64>()
        .map_err(|_| ApiError::not_found())
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }),
        }
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        warn!(error = ?error, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "request failed")
    }
}

impl From<ResolveError> for ApiError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::NotFound | ResolveError::BasenameMismatch => Self::not_found(),
            ResolveError::Store(error) => error.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self
            .body
            .get("error")
            .and_then(Value::as_str)
            .map(sanitize_header_text);
        let mut response = (self.status, Json(self.body)).into_response();
        if let Some(value) = message.and_then(|message| HeaderValue::from_str(&message).ok()) {
            response.headers_mut().insert("X-Photolib-Error", value);
        }
        response
    }
}

fn sanitize_header_text(value: &str) -> String {
    let mut sanitized: String = value
        .chars()
        .filter(|ch| ch.is_ascii() && !ch.is_control() && *ch != '"' && *ch != '\\')
        .collect();
    sanitized.truncate(200);
    sanitized
}
