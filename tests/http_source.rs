//! HTTP content source tests against a local stand-in server.

mod common;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use image::{ImageFormat, RgbImage};
use serde_json::{json, Value};
use signage_player::content::Resolution;
use signage_player::profile::DeviceProfile;
use signage_player::source::{ContentSource, HttpContentSource, Scope};
use signage_player::surface::{HeadlessSurface, Surfaces};
use signage_player::{PlaybackState, PlayerError, SignagePlayer};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct ServerState {
    failing: Arc<AtomicBool>,
    reports: Arc<Mutex<Vec<Value>>>,
    statuses: Arc<Mutex<Vec<Value>>>,
}

async fn content(
    State(state): State<ServerState>,
    Path((network, subnetwork)): Path<(String, String)>,
) -> impl IntoResponse {
    if state.failing.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    assert_eq!((network.as_str(), subnetwork.as_str()), ("net", "lobby"));
    Json(json!([
        { "id": "a", "type": "image", "url": "/media/a.png", "duration": 10 },
        { "id": "b", "type": "image", "url": "/media/b.png", "duration": 10 },
        { "id": "broken", "type": "hologram", "url": "/x", "duration": 10 }
    ]))
    .into_response()
}

async fn optimized(
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mut keys: Vec<_> = params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    keys.sort();
    Json(json!({ "url": format!("https://cdn.local/{}?{}", id, keys.join("&")) }))
}

async fn profile(Path(id): Path<String>) -> impl IntoResponse {
    if id == "dev-1" {
        Json(json!({ "maxBitrate": 3000 })).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn playback(State(state): State<ServerState>, Json(body): Json<Value>) -> StatusCode {
    state.reports.lock().unwrap().push(body);
    StatusCode::NO_CONTENT
}

async fn status(State(state): State<ServerState>, Json(body): Json<Value>) -> StatusCode {
    state.statuses.lock().unwrap().push(body);
    StatusCode::NO_CONTENT
}

async fn media() -> impl IntoResponse {
    let mut out = Cursor::new(Vec::new());
    RgbImage::new(8, 8).write_to(&mut out, ImageFormat::Png).unwrap();
    ([(header::CONTENT_TYPE, "image/png")], out.into_inner())
}

async fn serve(state: ServerState) -> String {
    let app = Router::new()
        .route("/api/networks/:network/subnetworks/:subnetwork/content", get(content))
        .route("/api/content/:id/optimized", get(optimized))
        .route("/api/devices/:id/profile", get(profile))
        .route("/api/devices/:id/status", put(status))
        .route("/api/analytics/playback", post(playback))
        .route("/media/:name", get(media))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn scope() -> Scope {
    Scope {
        device_id: "dev-1".into(),
        network_id: "net".into(),
        subnetwork_id: "lobby".into(),
    }
}

fn settings_for(server_url: &str) -> signage_player::Settings {
    let mut settings = common::settings();
    settings.server_url = server_url.into();
    settings.device.device_id = "dev-1".into();
    settings.device.network_id = "net".into();
    settings.device.subnetwork_id = "lobby".into();
    settings.network.realtime = false;
    settings.profile.fetch_remote = true;
    settings
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_fetch_playlist_skips_malformed_entries() {
    let server = serve(ServerState::default()).await;
    let source = HttpContentSource::new(&settings_for(&server), scope()).unwrap();

    let items = source.fetch_playlist().await.unwrap();
    let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn test_server_failure_serves_last_known_good() {
    let state = ServerState::default();
    let server = serve(state.clone()).await;
    let source = HttpContentSource::new(&settings_for(&server), scope()).unwrap();

    assert_eq!(source.fetch_playlist().await.unwrap().len(), 2);

    state.failing.store(true, Ordering::SeqCst);
    let items = source.fetch_playlist().await.unwrap();
    assert_eq!(items.len(), 2);
}

#[tokio::test]
async fn test_server_failure_without_snapshot_is_unavailable() {
    let state = ServerState::default();
    state.failing.store(true, Ordering::SeqCst);
    let server = serve(state).await;
    let source = HttpContentSource::new(&settings_for(&server), scope()).unwrap();

    let err = source.fetch_playlist().await.unwrap_err();
    assert!(matches!(err, PlayerError::ContentUnavailable));
}

#[tokio::test]
async fn test_optimized_url_carries_device_hints() {
    let server = serve(ServerState::default()).await;
    let source = HttpContentSource::new(&settings_for(&server), scope()).unwrap();
    let mut profile = DeviceProfile::new("dev-1", Resolution::new(1280, 720));
    profile.max_bitrate = Some(2500);
    profile.preferred_format = Some("video/mp4".into());

    let url = source.resolve_optimized_url("a", &profile).await.unwrap();
    assert_eq!(
        url,
        "https://cdn.local/a?bitrate=2500&deviceId=dev-1&format=video/mp4&resolution=1280x720"
    );
}

#[tokio::test]
async fn test_profile_lookup() {
    let server = serve(ServerState::default()).await;
    let source = HttpContentSource::new(&settings_for(&server), scope()).unwrap();
    let update = source.fetch_profile().await.unwrap().unwrap();
    assert_eq!(update.max_bitrate, Some(3000));

    let mut other = scope();
    other.device_id = "unknown".into();
    let source = HttpContentSource::new(&settings_for(&server), other).unwrap();
    assert_eq!(source.fetch_profile().await.unwrap(), None);
}

#[tokio::test]
async fn test_playback_report_body() {
    let state = ServerState::default();
    let server = serve(state.clone()).await;
    let source = HttpContentSource::new(&settings_for(&server), scope()).unwrap();

    source.report_playback("a");
    wait_for(|| !state.reports.lock().unwrap().is_empty()).await;

    let report = state.reports.lock().unwrap()[0].clone();
    assert_eq!(report["deviceId"], "dev-1");
    assert_eq!(report["networkId"], "net");
    assert_eq!(report["subnetworkId"], "lobby");
    assert_eq!(report["contentId"], "a");
    assert!(report["timestamp"].is_string());
}

#[tokio::test]
async fn test_player_end_to_end_over_http() {
    let state = ServerState::default();
    let server = serve(state.clone()).await;
    let settings = settings_for(&server);

    let (a, b, probe) = HeadlessSurface::pair();
    let player = SignagePlayer::initialize(
        settings.clone(),
        Scope::from_settings(&settings),
        Surfaces::new(Box::new(a), Box::new(b)),
    )
    .await
    .unwrap();

    wait_for(|| probe.showing().as_deref() == Some("a")).await;
    wait_for(|| !state.reports.lock().unwrap().is_empty()).await;
    wait_for(|| {
        state
            .statuses
            .lock()
            .unwrap()
            .iter()
            .any(|s| s["status"] == "playing")
    })
    .await;

    let status = player.status().await.unwrap();
    assert_eq!(status.state, PlaybackState::Playing);
    assert_eq!(status.playlist_len, 2);

    wait_for(|| player.cache().stats().entries == 2).await;
    // The stored profile's bitrate ceiling was applied at start.
    let entry = player.cache().lookup("a").unwrap();
    assert!(entry.fetched_url.contains("bitrate=3000"));
    assert_eq!(entry.metadata.width, Some(8));

    player.shutdown().await.unwrap();
}
