use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::crypto;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct SignedParams {
    pub sig: String,
    pub exp: i64,
}

/// Header-less blob access: the URL itself carries an expiring HMAC
/// signature over the path, so links can be handed to renderers that cannot
/// attach credentials.
pub async fn serve_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(params): Query<SignedParams>,
) -> Response {
    let now = chrono::Utc::now().timestamp();
    let signed_path = format!("/files/{path}");
    if !crypto::verify_path(
        &signed_path,
        params.exp,
        &params.sig,
        &state.config.auth.signing_secret,
        now,
    ) {
        return (StatusCode::FORBIDDEN, "invalid or expired signature").into_response();
    }

    match state.blobs.get(&path).await {
        Ok(Some(bytes)) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => e.into_response(),
    }
}
