//! Persona and knowledge-document admin endpoints

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{AppState, MAX_UPLOAD_BYTES};
use crate::knowledge::{PersonaRecord, DEFAULT_PERSONA_NAME};

/// Accepted upload mimetypes. Binary document formats are rejected;
/// the extraction stage only understands UTF-8 text.
const ACCEPTED_MIMETYPES: &[&str] = &["text/plain", "text/markdown", "text/x-markdown"];

fn persona_response(record: &PersonaRecord) -> serde_json::Value {
    json!({
        "id": record.id,
        "name": record.name,
        "content": record.content,
        "content_length": record.content.len(),
        "created_at": record.created_at,
        "updated_at": record.updated_at,
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    warn!("Admin request failed: {:#}", e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

// ─── Personas ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PersonaQuery {
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn get_persona(
    State(state): State<AppState>,
    Query(query): Query<PersonaQuery>,
) -> Response {
    let name = query.name.unwrap_or_else(|| DEFAULT_PERSONA_NAME.to_string());

    // Loading seeds the built-in fallback if the record is absent, so a
    // fresh deployment still answers with a persona.
    if let Err(e) = state.deps.store.load_persona(&name).await {
        return internal_error(e);
    }
    match state.deps.store.get_persona(&name).await {
        Ok(Some(record)) => Json(persona_response(&record)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "persona not found"),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PersonaUpdate {
    #[serde(default)]
    pub name: Option<String>,
    pub content: String,
}

pub async fn update_persona(
    State(state): State<AppState>,
    Json(update): Json<PersonaUpdate>,
) -> Response {
    if update.content.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "content must not be empty");
    }
    let name = update.name.unwrap_or_else(|| DEFAULT_PERSONA_NAME.to_string());
    match state.deps.store.update_persona(&name, &update.content).await {
        Ok(record) => Json(persona_response(&record)).into_response(),
        Err(e) => internal_error(e),
    }
}

// ─── Documents ───────────────────────────────────────────────

pub async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload.txt").to_string();
        let mimetype = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| mimetype_from_filename(&filename).to_string());

        if !ACCEPTED_MIMETYPES.contains(&mimetype.as_str()) {
            return error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "only text and markdown documents are supported",
            );
        }

        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Upload read failed: {}", e);
                return error_response(StatusCode::BAD_REQUEST, "failed to read upload");
            }
        };
        if bytes.len() > MAX_UPLOAD_BYTES {
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, "document exceeds 10 MB");
        }

        let content = match String::from_utf8(bytes.to_vec()) {
            Ok(content) => content,
            Err(_) => {
                return error_response(StatusCode::BAD_REQUEST, "document is not valid UTF-8")
            }
        };
        if content.trim().is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "document is empty");
        }

        return match state.deps.store.insert_document(&filename, &mimetype, &content).await {
            Ok(record) => {
                info!("Uploaded \"{}\" ({} chars)", record.filename, record.content.len());
                (
                    StatusCode::CREATED,
                    Json(json!({
                        "id": record.id,
                        "filename": record.filename,
                        "mimetype": record.mimetype,
                        "content_length": record.content.len(),
                        "uploaded_at": record.uploaded_at,
                    })),
                )
                    .into_response()
            }
            Err(e) => internal_error(e),
        };
    }

    error_response(StatusCode::BAD_REQUEST, "multipart field \"file\" is required")
}

fn mimetype_from_filename(filename: &str) -> &'static str {
    let lower = filename.to_lowercase();
    if lower.ends_with(".md") || lower.ends_with(".markdown") {
        "text/markdown"
    } else if lower.ends_with(".txt") {
        "text/plain"
    } else {
        "application/octet-stream"
    }
}

pub async fn list_documents(State(state): State<AppState>) -> Response {
    match state.deps.store.list_documents().await {
        Ok(documents) => Json(json!({ "documents": documents })).into_response(),
        Err(e) => internal_error(e),
    }
}

pub async fn get_document(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.deps.store.get_document(&id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "document not found"),
        Err(e) => internal_error(e),
    }
}

pub async fn delete_document(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.deps.store.delete_document(&id).await {
        Ok(true) => Json(json!({ "success": true })).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "document not found"),
        Err(e) => internal_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mimetype_from_filename() {
        assert_eq!(mimetype_from_filename("notes.md"), "text/markdown");
        assert_eq!(mimetype_from_filename("README.MARKDOWN"), "text/markdown");
        assert_eq!(mimetype_from_filename("kb.txt"), "text/plain");
        assert_eq!(mimetype_from_filename("report.pdf"), "application/octet-stream");
    }
}
