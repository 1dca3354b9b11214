use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use hf_hub::api::tokio::ApiBuilder;
use log::{error, info};
use lucent_core::{load_predictor, DeviceMap, Error, GenerationRequest, Predictor, Settings};
use serde::Serialize;
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::Mutex};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Lucent SDXL prediction server")]
struct Args {
    /// JSON settings file. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Base SDXL model, hub repository id or local directory
    #[arg(long)]
    base_model: Option<String>,

    /// Fine-tune bundle applied before serving
    #[arg(long)]
    default_weights: Option<String>,

    /// Where downloaded weight bundles are kept
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Where generated images are written
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

impl Args {
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        if self.cpu {
            settings.device = DeviceMap::ForceCpu;
        }
        if let Some(base_model) = &self.base_model {
            settings.base_model = base_model.clone();
        }
        if let Some(weights) = &self.default_weights {
            settings.default_weights = Some(weights.clone());
        }
        if let Some(dir) = &self.cache_dir {
            settings.cache_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            settings.output_dir = dir.clone();
        }
        Ok(settings)
    }
}

fn image_to_base64_png(path: &Path) -> Result<String> {
    let img = image::open(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

/// Writes a `data:<mime>;base64,<payload>` input to a file in `dir`.
fn materialize_data_uri(uri: &str, dir: &Path, name: &str) -> Result<PathBuf> {
    let (_, payload) = uri
        .split_once(";base64,")
        .ok_or_else(|| anyhow!("{name} is a data URI without a base64 payload"))?;
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .with_context(|| format!("{name} is not valid base64"))?;
    let format = image::guess_format(&bytes).with_context(|| format!("{name} is not an image"))?;
    let ext = format.extensions_str().first().copied().unwrap_or("png");
    let path = dir.join(format!("{name}.{ext}"));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

/// Replaces data URI image inputs with files in a temporary directory that
/// lives as long as the returned guard.
fn materialize_inputs(request: &mut GenerationRequest) -> Result<Option<TempDir>> {
    let mut dir = None;
    let fields = [
        ("image", &mut request.image),
        ("mask", &mut request.mask),
        ("controlnet_image", &mut request.controlnet_image),
    ];
    for (name, field) in fields {
        let Some(uri) = field.as_ref().and_then(|p| p.to_str()).filter(|p| p.starts_with("data:")) else {
            continue;
        };
        let uri = uri.to_string();
        if dir.is_none() {
            dir = Some(tempfile::tempdir()?);
        }
        if let Some(dir) = &dir {
            *field = Some(materialize_data_uri(&uri, dir.path(), name)?);
        }
    }
    Ok(dir)
}

#[derive(Serialize)]
struct GenerationResponse {
    output: Vec<PathBuf>,
    images: Vec<String>,
    seed: u64,
    rejected: Vec<usize>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        e if e.is_user_facing() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: String) -> axum::response::Response {
    (status, Json(ErrorResponse { error: message })).into_response()
}

// Application state holding the loaded predictor. One generation at a time.
#[derive(Clone)]
struct AppState(Arc<Mutex<Predictor>>);

async fn generate_image_handler(
    State(state): State<AppState>,
    Json(mut req): Json<GenerationRequest>,
) -> impl IntoResponse {
    let _inputs = match materialize_inputs(&mut req) {
        Ok(dir) => dir,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("{e:#}")),
    };

    let prediction = {
        let mut predictor = state.0.lock().await;
        predictor.predict(&req).await
    };
    let prediction = match prediction {
        Ok(prediction) => prediction,
        Err(e) => {
            error!("prediction failed: {e}");
            return error_response(status_for(&e), e.to_string());
        }
    };

    let images = match prediction
        .output
        .iter()
        .map(|path| image_to_base64_png(path))
        .collect::<Result<Vec<_>>>()
    {
        Ok(images) => images,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    };
    Json(GenerationResponse {
        output: prediction.output,
        images,
        seed: prediction.seed,
        rejected: prediction.rejected,
    })
    .into_response()
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // set `RUST_LOG=debug` to see debug logs
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info,tokenizers=error"),
    )
    .format_module_path(false)
    .format_target(false)
    .init();

    let settings = args.settings()?;
    let mut api = ApiBuilder::new();
    if let Some(dir) = &settings.hub_cache_dir {
        api = api.with_cache_dir(dir.clone());
    }
    let predictor = load_predictor(&settings, api.build()?).await?;

    let app_state = AppState(Arc::new(Mutex::new(predictor)));

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/health", get(health_handler))
        .with_state(app_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_data_uri() -> String {
        let mut bytes = Vec::new();
        image::DynamicImage::new_rgb8(8, 8)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        format!("data:image/png;base64,{}", BASE64_STANDARD.encode(&bytes))
    }

    #[test]
    fn data_uris_become_files() {
        let mut request = GenerationRequest {
            image: Some(PathBuf::from(png_data_uri())),
            mask: Some(PathBuf::from("/already/a/path.png")),
            ..Default::default()
        };
        let dir = materialize_inputs(&mut request).unwrap().unwrap();
        let image = request.image.unwrap();
        assert!(image.starts_with(dir.path()));
        assert!(image::open(&image).is_ok());
        assert_eq!(request.mask, Some(PathBuf::from("/already/a/path.png")));
    }

    #[test]
    fn plain_paths_need_no_temp_dir() {
        let mut request = GenerationRequest::default();
        assert!(materialize_inputs(&mut request).unwrap().is_none());
    }

    #[test]
    fn malformed_data_uri_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(materialize_data_uri("data:image/png,notbase64", dir.path(), "image").is_err());
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(
            status_for(&Error::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::AllOutputsRejected { count: 1 }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&Error::Poisoned("shared components")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn command_line_overrides_settings() {
        let args = Args::parse_from(["lucent-server", "--cpu", "--base-model", "/models/sdxl"]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.device, DeviceMap::ForceCpu);
        assert_eq!(settings.base_model, "/models/sdxl");
    }
}
