#![forbid(unsafe_code)]

//! Admin-only upload server.
//!
//! One administrator logs in, uploads a video with an optional subtitle, and
//! the resulting `video.mp4` / `subtitle.vtt` pair is served from the staging
//! directory under `/static/`.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Form, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, FromRef, Multipart, Path as AxumPath, State, multipart::MultipartError,
    },
    http::{StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::Deserialize;
use subtitle_stage::{
    config::{DEFAULT_ENV_PATH, RuntimeOverrides, resolve_runtime_settings},
    credentials::CredentialStore,
    normalizer::{SkipReason, SubtitleOutcome, UploadedFile},
    pages,
    pipeline::{PipelineError, Upload, UploadPipeline},
    security::ensure_not_root,
    session::{FlashLevel, Session, SessionStore},
    staging::FsStagingStore,
    transcoder::Ffmpeg,
};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const WRONG_PASSWORD: &str = "Wrong password!";
const LOGIN_REQUIRED: &str = "Please log in first.";
const VIDEO_REQUIRED: &str = "A video file is required!";

#[derive(Debug, Parser)]
#[command(name = "server", about = "Serve the admin upload dashboard")]
struct ServerArgs {
    /// Address to listen on (overrides STAGE_HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides STAGE_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding the staged video and subtitle (overrides STAGING_DIR).
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Env file read before the process environment.
    #[arg(long, default_value = DEFAULT_ENV_PATH)]
    env_file: PathBuf,
}

impl ServerArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            staging_dir: self.staging_dir.clone(),
            stage_port: self.port,
            stage_host: self.host.clone(),
            env_path: Some(self.env_file.clone()),
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/STAGE_HOST")
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    credentials: Arc<CredentialStore>,
    sessions: Arc<SessionStore>,
    pipeline: Arc<UploadPipeline>,
}

impl FromRef<AppState> for Arc<SessionStore> {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct PasswordForm {
    #[serde(default)]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let args = ServerArgs::parse();

    ensure_not_root("server")?;

    let settings = resolve_runtime_settings(args.overrides())?;
    let host = parse_host_arg(&settings.stage_host)?;

    let staging = FsStagingStore::new(&settings.staging_dir);
    staging.prepare()?;

    let credentials =
        CredentialStore::open(&settings.database_url, &settings.database_auth_token)
            .await
            .context("initializing credential store")?;
    match &settings.admin_password {
        Some(password) => {
            if credentials.seed_if_empty(password).await? {
                tracing::info!("seeded administrator credential from ADMIN_PASSWORD");
            }
        }
        None => {
            if credentials.stored_hash().await?.is_none() {
                tracing::warn!("no administrator credential stored; set ADMIN_PASSWORD to create one");
            }
        }
    }

    let ffmpeg = Ffmpeg::new(settings.ffmpeg_bin.clone(), settings.ffmpeg_timeout);
    tracing::info!(
        staging_dir = %settings.staging_dir.display(),
        ffmpeg = %ffmpeg.binary().display(),
        timeout = ?settings.ffmpeg_timeout,
        "upload pipeline ready"
    );

    let state = AppState {
        credentials: Arc::new(credentials),
        sessions: Arc::new(SessionStore::new(settings.session_ttl)),
        pipeline: Arc::new(UploadPipeline::new(
            Arc::new(staging),
            ffmpeg,
            settings.unknown_subtitle_policy,
        )),
    };

    let app = build_router(state, settings.max_upload_bytes);

    let addr = SocketAddr::new(host, settings.stage_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subtitle_stage=info,server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/static/{filename}", get(serve_static))
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", get(logout))
        .route(
            "/change-password",
            get(change_password_page).post(change_password_submit),
        )
        .route("/dashboard", get(dashboard_page).post(dashboard_upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!("failed to install Ctrl+C handler: {}", err);
    }
}

async fn index() -> Html<String> {
    Html(pages::index())
}

async fn serve_static(
    State(state): State<AppState>,
    AxumPath(filename): AxumPath<String>,
) -> ApiResult<Response> {
    ensure_safe_path_segment(&filename)?;
    stream_file(state.pipeline.staging_root().join(&filename)).await
}

async fn login_page(session: Session) -> Response {
    let flashes = session.take_flashes();
    session.finish(Html(pages::login(&flashes)))
}

async fn login_submit(
    State(state): State<AppState>,
    mut session: Session,
    Form(form): Form<PasswordForm>,
) -> ApiResult<Response> {
    let valid = state.credentials.verify(&form.password).await.map_err(|err| {
        tracing::error!(error = %format!("{err:#}"), "credential lookup failed");
        ApiError::internal("credential store unavailable")
    })?;

    if valid {
        session.log_in();
        tracing::info!("administrator logged in");
        return Ok(session.finish(Redirect::to("/dashboard")));
    }

    tracing::warn!("rejected login attempt");
    session.flash(FlashLevel::Error, WRONG_PASSWORD);
    Ok(session.finish(Redirect::to("/login")))
}

async fn logout(mut session: Session) -> Response {
    session.log_out();
    session.finish(Redirect::to("/login"))
}

/// Sends anonymous visitors to the login page.
fn require_login(mut session: Session) -> Result<Session, Response> {
    if session.is_authenticated() {
        return Ok(session);
    }
    session.flash(FlashLevel::Error, LOGIN_REQUIRED);
    Err(session.finish(Redirect::to("/login")))
}

async fn change_password_page(session: Session) -> Response {
    let session = match require_login(session) {
        Ok(session) => session,
        Err(redirect) => return redirect,
    };
    let flashes = session.take_flashes();
    session.finish(Html(pages::change_password(&flashes)))
}

async fn change_password_submit(
    State(state): State<AppState>,
    session: Session,
    Form(form): Form<PasswordForm>,
) -> ApiResult<Response> {
    let mut session = match require_login(session) {
        Ok(session) => session,
        Err(redirect) => return Ok(redirect),
    };

    if form.password.is_empty() {
        session.flash(FlashLevel::Error, "The new password must not be empty.");
        return Ok(session.finish(Redirect::to("/change-password")));
    }

    state
        .credentials
        .set_password(&form.password)
        .await
        .map_err(|err| {
            tracing::error!(error = %format!("{err:#}"), "storing new password failed");
            ApiError::internal("credential store unavailable")
        })?;
    tracing::info!("administrator password changed");

    session.log_out();
    session.flash(FlashLevel::Info, "Password changed. Please log in again.");
    Ok(session.finish(Redirect::to("/login")))
}

async fn dashboard_page(State(state): State<AppState>, session: Session) -> Response {
    let session = match require_login(session) {
        Ok(session) => session,
        Err(redirect) => return redirect,
    };
    let staged = state.pipeline.current().await;
    let flashes = session.take_flashes();
    session.finish(Html(pages::dashboard(
        &flashes,
        staged.video.as_deref(),
        staged.subtitle.as_deref(),
    )))
}

async fn dashboard_upload(
    State(state): State<AppState>,
    session: Session,
    multipart: Multipart,
) -> ApiResult<Response> {
    let mut session = match require_login(session) {
        Ok(session) => session,
        Err(redirect) => return Ok(redirect),
    };

    let upload = read_upload(multipart)
        .await
        .map_err(|err| ApiError::bad_request(err.body_text()))?;

    match state.pipeline.run(upload).await {
        Ok(report) => {
            if let SubtitleOutcome::Skipped(SkipReason::UnsupportedFormat(ext)) = &report.outcome {
                session.flash(FlashLevel::Info, unsupported_subtitle_notice(ext));
            }
            let flashes = session.take_flashes();
            Ok(session.finish(Html(pages::dashboard(
                &flashes,
                Some(&report.video),
                report.subtitle.as_deref(),
            ))))
        }
        Err(PipelineError::MissingVideo) => {
            session.flash(FlashLevel::Error, VIDEO_REQUIRED);
            Ok(session.finish(Redirect::to("/dashboard")))
        }
        Err(err) if err.is_user_error() => {
            session.flash(FlashLevel::Error, err.to_string());
            Ok(session.finish(Redirect::to("/dashboard")))
        }
        Err(err) => {
            tracing::error!(error = %err, "upload failed");
            session.flash(
                FlashLevel::Error,
                "Processing the upload failed. Check the server log for details.",
            );
            Ok(session.finish(Redirect::to("/dashboard")))
        }
    }
}

fn unsupported_subtitle_notice(ext: &str) -> String {
    if ext.is_empty() {
        "The subtitle file has no extension and was ignored. Upload .vtt, .srt, .ass or .ssa."
            .to_string()
    } else {
        format!("Subtitle files ending in .{ext} are not supported and were ignored. Upload .vtt, .srt, .ass or .ssa.")
    }
}

/// Collects the `video` and `subtitle` parts. File inputs left empty by the
/// browser arrive as nameless, empty parts and are treated as absent.
async fn read_upload(mut multipart: Multipart) -> Result<Upload, MultipartError> {
    let mut upload = Upload {
        video: None,
        subtitle: None,
    };
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or_default().to_string();
        let content = field.bytes().await?;
        if file_name.is_empty() && content.is_empty() {
            continue;
        }
        let file = UploadedFile { file_name, content };
        match name.as_str() {
            "video" => upload.video = Some(file),
            "subtitle" => upload.subtitle = Some(file),
            _ => {}
        }
    }
    Ok(upload)
}

/// Validates that a single dynamic path segment never escapes its base folder.
fn ensure_safe_path_segment(value: &str) -> ApiResult<()> {
    if value.is_empty()
        || Path::new(value)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }

    Ok(())
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(ApiError::not_found("file not found"));
    }

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, metadata.len().into());
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    // The slots are overwritten in place on every upload.
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));

    Ok(response)
}
