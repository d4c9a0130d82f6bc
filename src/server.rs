//! HTTP surface of the captioning service.

use crate::{
    blip::DEFAULT_MAX_LENGTH,
    engine::{EngineError, InferenceEngine},
    messages::{DescribeResponse, ErrorResponse, HealthResponse},
    model::{CaptionModel, CaptionRequest},
    preprocess::{DEFAULT_MAX_IMAGE_BYTES, DecodeError, decode_image},
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartError},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

/// Name of the multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

/// Extra room for the multipart framing around the image bytes.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Request handling settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Caption length passed to the model, start token included.
    pub max_length: usize,
    /// Largest accepted image, in bytes.
    pub max_image_bytes: usize,
}

impl ServerConfig {
    /// Largest accepted request body: the image plus the multipart framing.
    pub fn body_limit(&self) -> usize {
        self.max_image_bytes.saturating_add(MULTIPART_OVERHEAD)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

struct AppState<M: CaptionModel> {
    engine: Arc<InferenceEngine<M>>,
    config: ServerConfig,
}

impl<M: CaptionModel> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Multipart(#[from] MultipartError),

    #[error("Request body is larger than {0} bytes")]
    BodyTooLarge(usize),

    #[error("Missing multipart field `image`")]
    MissingImage,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Multipart(e) => e.status(),
            ApiError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::MissingImage => StatusCode::BAD_REQUEST,
            ApiError::Decode(DecodeError::TooLarge(..)) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Decode(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed: {}", self);
        } else {
            log::warn!("Rejected request: {}", self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Builds the router of the service around an engine.
pub fn router<M: CaptionModel>(engine: Arc<InferenceEngine<M>>, config: ServerConfig) -> Router {
    let body_limit = config.body_limit();

    Router::new()
        .route("/", get(|| async { "Welcome to the BLIP captioner!" }))
        .route("/health", get(get_health::<M>))
        .route("/describe", post(post_describe::<M>))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine, config })
}

/// Serves the router until Ctrl+C is received.
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("Shutting down"),
        Err(e) => {
            log::error!("Cannot listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

async fn get_health<M: CaptionModel>(State(state): State<AppState<M>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: state.engine.state().as_str().to_string(),
    })
}

async fn post_describe<M: CaptionModel>(
    State(state): State<AppState<M>>,
    mut multipart: Multipart,
) -> Result<Json<DescribeResponse>, ApiError> {
    let bytes = read_image_field(&mut multipart, state.config.body_limit()).await?;

    let (image, info) = decode_image(&bytes, state.config.max_image_bytes)?;
    log::debug!(
        "Decoded {:?} image {}x{} ({} bytes)",
        info.format,
        info.width,
        info.height,
        info.size_bytes
    );

    let result = state
        .engine
        .run(CaptionRequest {
            image,
            max_length: state.config.max_length,
        })
        .await?;

    log::info!(
        "Captioned request {} ({}x{}) in {:?}: {} tokens",
        result.id,
        result.request_metadata.width,
        result.request_metadata.height,
        result.duration,
        result.response.generated_tokens
    );

    Ok(Json(DescribeResponse {
        description: result.response.caption,
    }))
}

// returns the bytes of the first `image` field, other fields are skipped
async fn read_image_field(multipart: &mut Multipart, body_limit: usize) -> Result<Bytes, ApiError> {
    let limit_error = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::BodyTooLarge(body_limit)
        } else {
            ApiError::Multipart(e)
        }
    };

    while let Some(field) = multipart.next_field().await.map_err(limit_error)? {
        if field.name() == Some(IMAGE_FIELD) {
            return field.bytes().await.map_err(limit_error);
        }
    }
    Err(ApiError::MissingImage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_status_codes() {
        assert_eq!(ApiError::MissingImage.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::BodyTooLarge(100).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Decode(DecodeError::UnsupportedFormat).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Decode(DecodeError::TooLarge(20, 10)).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Engine(EngineError::Stopped).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn body_limit_leaves_room_for_framing() {
        let config = ServerConfig {
            max_image_bytes: 1000,
            ..ServerConfig::default()
        };
        assert_eq!(config.body_limit(), 1000 + MULTIPART_OVERHEAD);
        assert_eq!(
            ApiError::BodyTooLarge(config.body_limit()).to_string(),
            format!("Request body is larger than {} bytes", 1000 + MULTIPART_OVERHEAD)
        );
    }

    #[test]
    fn api_error_response_carries_the_message() {
        let response = ApiError::MissingImage.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()["content-type"], "application/json");
    }
}
