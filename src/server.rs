//! HTTP surface: upload form, `POST /compress-mp4` and `GET /health`.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::error::CompressionError;
use crate::orchestrator::{CompressionOrchestrator, CompressionRequest, SourceMedia};

const UPLOAD_FORM: &str = r#"<html>
    <head>
        <title>Video Compression Service</title>
    </head>
    <body>
        <h1>Upload MP4 Video for Compression</h1>
        <form action="/compress-mp4" method="post" enctype="multipart/form-data">
            <p>
                <label for="video">Select MP4 file:</label><br>
                <input type="file" id="video" name="video" accept="video/mp4" required>
            </p>
            <p>
                <label for="target_size_mb">Target size (MB):</label><br>
                <input type="number" id="target_size_mb" name="target_size_mb" value="8.0" step="0.1" min="0.1">
            </p>
            <p>
                <label for="maintain_aspect_ratio">Maintain aspect ratio:</label>
                <input type="hidden" name="maintain_aspect_ratio" value="false">
                <input type="checkbox" id="maintain_aspect_ratio" name="maintain_aspect_ratio" value="true" checked>
            </p>
            <input type="submit" value="Compress Video">
        </form>
    </body>
</html>
"#;

/// Shared handler state.
#[derive(Clone)]
pub struct AppContext {
    pub orchestrator: Arc<CompressionOrchestrator>,
    /// Cancelled on shutdown; every request runs under a child token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Origins allowed by CORS. `*` allows any origin; empty disables CORS headers.
    pub allowed_origins: Vec<String>,
    pub max_upload_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

impl IntoResponse for CompressionError {
    fn into_response(self) -> Response {
        let status = match &self {
            CompressionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CompressionError::Probe(_)
            | CompressionError::InvalidDuration(_)
            | CompressionError::BitrateFloorViolation { .. }
            | CompressionError::TargetSizeExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CompressionError::EncodeTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CompressionError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::from(Any)
    } else {
        let values: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    log::warn!(target: "mp4_squeeze::server", "Ignoring invalid CORS origin {:?}", o);
                    None
                }
            })
            .collect();
        AllowOrigin::list(values)
    };
    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE]),
    )
}

pub fn create_router(ctx: AppContext, options: &ServerOptions) -> Router {
    let router = Router::new()
        .route("/", get(upload_form))
        .route("/health", get(health))
        .route("/compress-mp4", post(compress_mp4))
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .with_state(ctx);
    match cors_layer(&options.allowed_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// Serve until `shutdown_signal` resolves, then cancel in-flight compressions and drain.
pub async fn serve(
    listener: TcpListener,
    ctx: AppContext,
    options: &ServerOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let token = ctx.shutdown.clone();
    let app = create_router(ctx, options);
    if let Ok(addr) = listener.local_addr() {
        log::info!(target: "mp4_squeeze::server", "Listening on http://{}", addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal.await;
            log::info!(target: "mp4_squeeze::server", "Shutting down, cancelling running jobs");
            token.cancel();
        })
        .await
}

async fn upload_form() -> Html<&'static str> {
    Html(UPLOAD_FORM)
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

fn parse_target_size(text: &str) -> Result<f64, CompressionError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(crate::config::DEFAULT_TARGET_SIZE_MB);
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| {
            CompressionError::InvalidRequest(format!(
                "target_size_mb must be a positive number, got {:?}",
                trimmed
            ))
        })
}

fn parse_bool_field(text: &str) -> Result<bool, CompressionError> {
    match text.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" => Ok(false),
        other => Err(CompressionError::InvalidRequest(format!(
            "maintain_aspect_ratio must be a boolean, got {:?}",
            other
        ))),
    }
}

/// Only MP4 uploads reach the encoder.
pub fn validate_upload_name(file_name: &str) -> Result<(), CompressionError> {
    if file_name.to_ascii_lowercase().ends_with(".mp4") {
        Ok(())
    } else {
        Err(CompressionError::InvalidRequest(
            "Only MP4 files are supported".to_string(),
        ))
    }
}

/// File name safe to put inside a quoted Content-Disposition value.
fn download_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && *c != '"')
        .collect();
    format!("compressed_{}", cleaned)
}

struct UploadForm {
    file_name: String,
    content: Bytes,
    target_size_mb: Option<f64>,
    maintain_aspect_ratio: Option<bool>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, CompressionError> {
    let malformed =
        |e: axum::extract::multipart::MultipartError| CompressionError::InvalidRequest(e.body_text());

    let mut upload: Option<(String, Bytes)> = None;
    let mut target_size_mb = None;
    let mut maintain_aspect_ratio = None;
    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("video") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content = field.bytes().await.map_err(malformed)?;
                upload = Some((file_name, content));
            }
            Some("target_size_mb") => {
                target_size_mb = Some(parse_target_size(&field.text().await.map_err(malformed)?)?);
            }
            Some("maintain_aspect_ratio") => {
                maintain_aspect_ratio =
                    Some(parse_bool_field(&field.text().await.map_err(malformed)?)?);
            }
            _ => {}
        }
    }

    let (file_name, content) = upload
        .ok_or_else(|| CompressionError::InvalidRequest("Missing `video` file field".to_string()))?;
    Ok(UploadForm {
        file_name,
        content,
        target_size_mb,
        maintain_aspect_ratio,
    })
}

async fn compress_mp4(
    State(ctx): State<AppContext>,
    multipart: Multipart,
) -> Result<Response, CompressionError> {
    let form = read_upload_form(multipart).await?;
    validate_upload_name(&form.file_name)?;
    if form.content.is_empty() {
        return Err(CompressionError::InvalidRequest(
            "No file content provided".to_string(),
        ));
    }
    log::info!(
        target: "mp4_squeeze::server",
        "Received {} ({:.2}MB), target={:?}MB maintain_aspect_ratio={:?}",
        form.file_name,
        form.content.len() as f64 / (1024.0 * 1024.0),
        form.target_size_mb,
        form.maintain_aspect_ratio
    );

    let request = CompressionRequest {
        source: SourceMedia::Bytes(form.content),
        target_size_mb: form.target_size_mb,
        maintain_aspect_ratio: form.maintain_aspect_ratio,
    };
    let cancel = ctx.shutdown.child_token();
    let artifact = ctx.orchestrator.compress(request, None, &cancel).await?;
    let body = artifact.read_bytes().await?;
    let summary = artifact.summary();
    drop(artifact);

    let disposition = format!("attachment; filename=\"{}\"", download_name(&form.file_name));
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    if let Ok(v) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, v);
    }
    headers.insert("x-video-bitrate", HeaderValue::from(summary.video_bitrate_bps));
    headers.insert(
        "x-output-dimensions",
        HeaderValue::from_str(&format!("{}x{}", summary.width, summary.height))
            .unwrap_or(HeaderValue::from_static("unknown")),
    );
    Ok(response)
}
