use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use jobboard_core::access::Permission;
use jobboard_core::types::Upload;
use jobboard_storage::NewUpload;

use super::ApiQuery;
use crate::auth::{AuthUser, MaybeAuthUser};
use crate::error::{ApiError, ApiResult};
use crate::router::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/uploads", post(upload))
        .route("/uploads/:id", get(download))
        .route("/uploads/:id/meta", get(metadata))
}

/// Accepted content types and the extension each is stored under.
const ALLOWED_TYPES: &[(&str, &str)] = &[
    ("application/pdf", "pdf"),
    ("application/msword", "doc"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "docx",
    ),
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("image/webp", "webp"),
];

const MAX_NAME_LEN: usize = 200;

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: Option<String>,
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    ALLOWED_TYPES
        .iter()
        .find(|(allowed, _)| *allowed == content_type)
        .map(|(_, ext)| *ext)
}

/// Last path component with anything outside `[A-Za-z0-9._-]` replaced.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let essence = value.split(';').next().unwrap_or_default().trim();
    Some(essence.to_ascii_lowercase())
}

async fn upload(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiQuery(query): ApiQuery<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<(StatusCode, Json<Upload>)> {
    auth.require(&[Permission::UploadsCreate])?;
    let content_type = media_type(&headers).unwrap_or_default();
    let ext = extension_for(&content_type).ok_or_else(|| {
        ApiError::UnsupportedMediaType(format!("content type `{content_type}` is not accepted"))
    })?;

    let max = state.settings().upload_max_bytes;
    let bytes = axum::body::to_bytes(body, max)
        .await
        .map_err(|_| ApiError::PayloadTooLarge(format!("uploads are limited to {max} bytes")))?;
    if bytes.is_empty() {
        return Err(ApiError::validation("upload body is empty"));
    }

    let stored_name = format!("{}.{ext}", Uuid::new_v4());
    let path = state.settings().upload_dir.join(&stored_name);
    tokio::fs::write(&path, &bytes).await?;

    let original_name = sanitize_filename(query.filename.as_deref().unwrap_or_default());
    let inserted = state
        .storage()
        .uploads()
        .insert(NewUpload {
            owner_id: auth.id().to_string(),
            original_name,
            content_type,
            size_bytes: bytes.len() as i64,
            checksum: hex::encode(Sha256::digest(&bytes)),
            stored_name,
            created_at: state.now(),
        })
        .await;
    let upload = match inserted {
        Ok(upload) => upload,
        Err(err) => {
            if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                warn!(
                    stage = "app",
                    path = %path.display(),
                    error = %remove_err,
                    "failed to remove orphaned upload"
                );
            }
            return Err(err.into());
        }
    };
    info!(stage = "app", upload_id = %upload.id, size = upload.size_bytes, "file uploaded");
    Ok((StatusCode::CREATED, Json(upload)))
}

/// Images are public. Documents are visible to their owner and admins.
async fn readable_upload(
    state: &AppState,
    viewer: Option<&AuthUser>,
    id: &str,
) -> ApiResult<Upload> {
    let upload = state
        .storage()
        .uploads()
        .find(id)
        .await?
        .ok_or(ApiError::NotFound("upload"))?;
    if upload.is_image() {
        return Ok(upload);
    }
    match viewer {
        None => Err(ApiError::Unauthorized("sign in to view this file")),
        Some(viewer) if viewer.id() == upload.owner_id || viewer.is_admin() => Ok(upload),
        Some(_) => Err(ApiError::forbidden("you cannot view this file")),
    }
}

async fn download(
    State(state): State<AppState>,
    MaybeAuthUser(viewer): MaybeAuthUser,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let upload = readable_upload(&state, viewer.as_ref(), &id).await?;
    let path = state.settings().upload_dir.join(&upload.stored_name);
    let bytes = tokio::fs::read(&path).await?;

    let content_type = HeaderValue::from_str(&upload.content_type).map_err(ApiError::internal)?;
    let disposition =
        HeaderValue::from_str(&format!("inline; filename=\"{}\"", upload.original_name))
            .map_err(ApiError::internal)?;
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

async fn metadata(
    State(state): State<AppState>,
    MaybeAuthUser(viewer): MaybeAuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Upload>> {
    Ok(Json(readable_upload(&state, viewer.as_ref(), &id).await?))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };

    use jobboard_core::access::Role;

    use super::sanitize_filename;
    use crate::test_support::{read_json, TestApp};

    fn upload_request(
        token: &str,
        filename: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Request<Body> {
        Request::post(format!("/uploads?filename={filename}"))
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\my cv (1).pdf"), "my_cv__1_.pdf");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename(""), "upload");
    }

    #[tokio::test]
    async fn documents_are_stored_with_a_checksum() {
        let app = TestApp::new().await;
        let (_, token) = app.user("ada@example.com", Role::JobSeeker).await;
        let (_, other) = app.user("bob@example.com", Role::JobSeeker).await;

        let response = app
            .send(upload_request(&token, "cv.pdf", "application/pdf", b"%PDF-1.4".to_vec()))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json(response).await;
        assert_eq!(body["original_name"], "cv.pdf");
        assert_eq!(body["size_bytes"], 8);
        assert_eq!(body["checksum"].as_str().unwrap().len(), 64);
        assert!(body.get("stored_name").is_none());

        let stored: Vec<_> = std::fs::read_dir(app.upload_dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].ends_with(".pdf"));

        let uri = format!("/uploads/{}", body["id"].as_str().unwrap());
        let (status, bytes) = app.raw_get(&uri, Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"%PDF-1.4");

        assert_eq!(app.raw_get(&uri, None).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(app.raw_get(&uri, Some(&other)).await.0, StatusCode::FORBIDDEN);
        let (status, meta) = app.get(&format!("{uri}/meta"), Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(meta["content_type"], "application/pdf");
    }

    #[tokio::test]
    async fn images_are_public() {
        let app = TestApp::new().await;
        let (_, token) = app.user("ada@example.com", Role::JobSeeker).await;
        let response = app
            .send(upload_request(&token, "logo.png", "image/png", vec![0x89, b'P', b'N', b'G']))
            .await;
        let body = read_json(response).await;

        let uri = format!("/uploads/{}", body["id"].as_str().unwrap());
        let response = app
            .send(Request::get(&uri).body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    }

    #[tokio::test]
    async fn failed_inserts_leave_no_file_behind() {
        let app = TestApp::new().await;
        let (_, token) = app.user("ada@example.com", Role::JobSeeker).await;
        sqlx::query(
            "CREATE TRIGGER reject_uploads BEFORE INSERT ON uploads \
             BEGIN SELECT RAISE(ABORT, 'uploads disabled'); END",
        )
        .execute(app.db().pool())
        .await
        .unwrap();

        let response = app
            .send(upload_request(&token, "cv.pdf", "application/pdf", b"%PDF-1.4".to_vec()))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(std::fs::read_dir(app.upload_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn rejects_bad_uploads() {
        let app = TestApp::new().await;
        let (_, token) = app.user("ada@example.com", Role::JobSeeker).await;

        let response = app
            .send(upload_request(&token, "run.sh", "text/x-shellscript", b"echo".to_vec()))
            .await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let response = app
            .send(upload_request(&token, "big.pdf", "application/pdf", vec![0; 2048]))
            .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = app
            .send(upload_request(&token, "empty.pdf", "application/pdf", Vec::new()))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
