// HTTP Server Module - Settings page, JSON and hardware endpoints
use anyhow::Result;
use axum::{
    extract::{Form, Json, Request, State},
    http::{
        header::{ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, WWW_AUTHENTICATE},
        HeaderValue, StatusCode,
    },
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::io_devices::DeviceError;
use crate::page::{self, PageContext};
use crate::pex_config::PexConfig;
use crate::port_extender::{validate_layout, Coverage, PexError, PortExtender};
use crate::types::{ChipType, PexStatus, StationRegistry};

/// Everything guarded by the state lock.
pub struct PexState {
    pub config: PexConfig,
    pub stations: StationRegistry,
    pub extender: PortExtender,
}

pub struct AppState {
    pub pex: RwLock<PexState>,
    pub data_dir: PathBuf,
    pub service: ServiceConfig,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(pex: PexState, data_dir: PathBuf, service: ServiceConfig) -> SharedState {
        Arc::new(AppState { pex: RwLock::new(pex), data_dir, service })
    }

    fn pex_config_path(&self) -> PathBuf {
        PexConfig::path_in(&self.data_dir)
    }

    /// Reload pex_config.json after an outside edit. Returns true if anything changed.
    pub async fn reload_from_disk(&self) -> Result<bool> {
        let mut loaded = PexConfig::load_from(&self.pex_config_path())?;
        let mut pex = self.pex.write().await;
        loaded.warnmsg = pex.config.warnmsg.clone();
        if loaded == pex.config {
            return Ok(false);
        }
        pex.config = loaded;
        pex.extender.reset();
        Ok(true)
    }
}

#[derive(Deserialize, Default)]
struct UpdateForm {
    enable_pex: Option<String>,
    auto_configure: Option<String>,
    auto_ic: Option<String>,
    demo_mode: Option<String>,
    bus: Option<u8>,
    debug: Option<String>,
}

#[derive(Deserialize)]
struct TestForm {
    tst_smbus: u8,
    tst_addr: String,
    tst_value: String,
}

#[derive(Deserialize)]
struct ZoneChange {
    values: Vec<u8>,
}

#[derive(Deserialize)]
struct StationUpdate {
    names: Vec<String>,
}

#[derive(Serialize)]
struct StationUpdateResponse {
    stations: usize,
    pex_status: PexStatus,
    warnmsg: String,
}

fn parse_hex_byte(text: &str) -> Option<u8> {
    let digits = text.trim().trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).ok()
}

/// Status that follows from the enable request and how well the layout fits the stations.
/// Leaves a warning when enabling is not possible.
fn resolve_status(pex: &mut PexState, enable: bool) -> PexStatus {
    if !enable {
        return PexStatus::Disabled;
    }
    let stations = pex.stations.len();
    let cfg = &mut pex.config;
    let problem = match validate_layout(&cfg.dev_configs, stations) {
        Ok(Coverage::Complete) => return PexStatus::Enabled,
        Ok(coverage) => PexError::Incomplete { coverage, stations },
        Err(e) => PexError::Layout(e),
    };
    if cfg.warnmsg.is_empty() {
        cfg.warnmsg = problem.to_string();
    }
    PexStatus::Unconfigured
}

fn regenerate_if_auto(pex: &mut PexState) {
    if !pex.config.auto_configure {
        return;
    }
    let stations = pex.stations.len();
    if let Err(e) = pex.extender.autoconfigure(&mut pex.config, stations) {
        warn!("PEX: autoconfigure failed: {}", e);
        pex.config.warnmsg = e.to_string();
    }
}

fn apply_update(pex: &mut PexState, form: UpdateForm) {
    let cfg = &mut pex.config;
    cfg.warnmsg.clear();

    if let Some(bus) = form.bus {
        cfg.default_smbus = bus;
    }
    if let Some(ic) = form.auto_ic.as_deref() {
        match ic.parse::<ChipType>() {
            Ok(chip) => cfg.default_ic_type = chip,
            Err(e) => warn!("PEX: ignoring chip type from form: {}", e),
        }
    }
    if let Some(debug) = form.debug.as_deref() {
        cfg.debug = debug == "on";
    }
    cfg.auto_configure = form.auto_configure.is_some();
    cfg.demo_mode = form.demo_mode.is_some();

    regenerate_if_auto(pex);
    pex.extender.reset();
    let enable = form.enable_pex.is_some();
    pex.config.enable_requested = enable;
    pex.config.pex_status = resolve_status(pex, enable);
}

fn render_page(pex: &PexState) -> String {
    page::render_settings_page(&PageContext {
        config: &pex.config,
        stations: &pex.stations,
        bus_available: pex.extender.bus_library_available(),
        supported: &ChipType::ALL,
    })
}

fn scan_default_bus(pex: &mut PexState) {
    let cfg = &mut pex.config;
    match pex.extender.scan(cfg.default_smbus, cfg.demo_mode) {
        Ok(found) => cfg.discovered_devices = found,
        // The page already carries the missing-library notice
        Err(DeviceError::LibraryUnavailable) => cfg.discovered_devices.clear(),
        Err(e) => {
            warn!("PEX: bus scan failed: {}", e);
            cfg.warnmsg = e.to_string();
        }
    }
}

async fn settings_page(State(state): State<SharedState>) -> impl IntoResponse {
    let mut pex = state.pex.write().await;
    scan_default_bus(&mut pex);
    Html(render_page(&pex))
}

async fn settings_json(State(state): State<SharedState>) -> impl IntoResponse {
    let pex = state.pex.read().await;
    (
        [(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))],
        Json(pex.config.clone()),
    )
}

async fn update_settings(
    State(state): State<SharedState>,
    Form(form): Form<UpdateForm>,
) -> Response {
    let mut pex = state.pex.write().await;
    apply_update(&mut pex, form);
    info!(
        "PEX: settings updated, status {} with {} device(s)",
        pex.config.pex_status,
        pex.config.dev_configs.len()
    );

    if let Err(e) = pex.config.save_to(&state.pex_config_path()) {
        error!("PEX: failed to save settings: {:#}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    Redirect::to("/pex").into_response()
}

async fn test_device(State(state): State<SharedState>, Form(form): Form<TestForm>) -> Response {
    let (Some(addr), Some(value)) = (parse_hex_byte(&form.tst_addr), parse_hex_byte(&form.tst_value)) else {
        return (StatusCode::BAD_REQUEST, "tst_addr and tst_value must be hex bytes").into_response();
    };

    let mut pex = state.pex.write().await;
    let demo = pex.config.demo_mode;
    if let Ok(false) = pex.extender.verify_handshake(form.tst_smbus, addr, demo) {
        warn!("PEX: no ACK from 0x{:02X} on bus {}", addr, form.tst_smbus);
    }
    match pex.extender.write_test_byte(form.tst_smbus, addr, value, demo) {
        Ok(()) => info!("PEX: test write 0x{:02X} to 0x{:02X} on bus {}", value, addr, form.tst_smbus),
        Err(e) => {
            warn!("PEX: test write failed: {}", e);
            pex.config.warnmsg = e.to_string();
        }
    }
    Redirect::to("/pex").into_response()
}

async fn zone_change(State(state): State<SharedState>, Json(payload): Json<ZoneChange>) -> Response {
    let mut guard = state.pex.write().await;
    let pex = &mut *guard;

    if payload.values.len() != pex.stations.len() {
        return (
            StatusCode::BAD_REQUEST,
            format!("expected {} station values, got {}", pex.stations.len(), payload.values.len()),
        )
            .into_response();
    }

    let values: Vec<bool> = payload.values.iter().map(|v| *v != 0).collect();
    match pex.extender.set_outputs(&mut pex.config, &values) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e @ PexError::Device(_)) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
    }
}

async fn stations_changed(
    State(state): State<SharedState>,
    Json(payload): Json<StationUpdate>,
) -> Response {
    let mut pex = state.pex.write().await;
    let count_changed = payload.names.len() != pex.stations.len();
    pex.stations = StationRegistry::new(payload.names);
    pex.config.warnmsg.clear();

    if count_changed {
        info!("PEX: number of stations changed to {}", pex.stations.len());
        regenerate_if_auto(&mut pex);
        pex.extender.reset();
    }
    // Only a settings form submit can switch outputs on
    if pex.config.enable_requested {
        pex.config.pex_status = resolve_status(&mut pex, true);
    }

    if let Err(e) = pex.config.save_to(&state.pex_config_path()) {
        error!("PEX: failed to save settings: {:#}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    if state.service.config_path.is_some() {
        let mut service = state.service.clone();
        service.station_names = pex.stations.names().to_vec();
        if let Err(e) = service.save() {
            warn!("Failed to save station names: {:#}", e);
        }
    }

    Json(StationUpdateResponse {
        stations: pex.stations.len(),
        pex_status: pex.config.pex_status,
        warnmsg: pex.config.warnmsg.clone(),
    })
    .into_response()
}

// HTTP access logging middleware
async fn logging_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let response = next.run(req).await;
    debug!("{} {} -> {}", method, uri, response.status());
    response
}

async fn basic_auth_middleware(
    State(state): State<SharedState>,
    req: Request,
    next: Next,
) -> Response {
    let service = &state.service;

    // If auth is disabled, pass through
    if !service.httpd_auth_enabled || service.httpd_auth_user.is_empty() || service.httpd_auth_pass.is_empty() {
        return next.run(req).await;
    }

    let auth_header = req.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    if let Some(encoded) = auth_header.and_then(|auth| auth.strip_prefix("Basic ")) {
        if let Ok(decoded) = general_purpose::STANDARD.decode(encoded) {
            if let Ok(credentials) = String::from_utf8(decoded) {
                if let Some((user, pass)) = credentials.split_once(':') {
                    if user == service.httpd_auth_user && pass == service.httpd_auth_pass {
                        return next.run(req).await;
                    }
                }
            }
        }
    }

    // Auth failed - return 401 with WWW-Authenticate header
    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"SIP PEX\""),
    );
    response
}

pub fn router(state: SharedState, static_dir: &Path) -> Router {
    Router::new()
        .route("/pex", get(settings_page))
        .route("/pex_scan", get(settings_page))
        .route("/pexj", get(settings_json))
        .route("/pexu", post(update_settings))
        .route("/pext", post(test_device))
        .route("/pexo", post(zone_change))
        .route("/pex_stations", post(stations_changed))
        .nest_service("/static", ServeDir::new(static_dir))
        .layer(middleware::from_fn_with_state(state.clone(), basic_auth_middleware))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(state)
}

pub async fn run_http_server(state: SharedState, ip: String, port: u16, static_dir: PathBuf) -> Result<()> {
    let app = router(state, &static_dir);
    let addr = format!("{}:{}", ip, port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}/pex", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
