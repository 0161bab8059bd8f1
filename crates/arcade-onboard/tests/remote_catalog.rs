use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use arcade_onboard::arbiter::{DownloadArbiter, ReqwestTransport};
use arcade_onboard::catalog::CatalogSource;
use arcade_onboard::channel::{ChannelClient, ChannelOptions};
use arcade_onboard::config::OnboardConfig;
use arcade_onboard::context::OnboardContext;
use arcade_onboard::remote::CatalogApi;
use arcade_onboard::OnboardError;
use arcade_types::{GameStage, Request, RequestBody, Response, ResponseBody};

const TOKEN: &str = "cabinet-token";

#[derive(Clone, Default)]
struct Hits {
    list: Arc<AtomicUsize>,
    archive: Arc<AtomicUsize>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

fn game_zip() -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut w = zip::ZipWriter::new(&mut buf);
        let opts = zip::write::SimpleFileOptions::default();
        w.start_file("publish/Snake", opts).unwrap();
        w.write_all(b"#!/bin/sh\nsleep 30\n").unwrap();
        w.start_file("publish/assets/level1.txt", opts).unwrap();
        w.write_all(b"#####\n#...#\n#####\n").unwrap();
        w.finish().unwrap();
    }
    buf.into_inner()
}

async fn game_list(State(hits): State<Hits>, headers: HeaderMap) -> impl IntoResponse {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    hits.list.fetch_add(1, Ordering::SeqCst);
    let body = serde_json::json!([
        { "id": "g1", "name": "Snake", "upload_date": "2023-01-01",
          "tags": [{ "name": "arcade", "description": "" }] },
        { "id": "g0", "name": "Snake", "upload_date": "2022-06-01" },
        { "id": "g2", "name": "Tetris", "upload_date": "2023-03-01" }
    ]);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn download(
    State(hits): State<Hits>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if id != "g1" {
        return StatusCode::NOT_FOUND.into_response();
    }
    hits.archive.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, game_zip()).into_response()
}

async fn banner(Path(id): Path<String>) -> impl IntoResponse {
    if id == "g1" {
        (StatusCode::OK, b"\x89PNG banner".to_vec()).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn start_server() -> (SocketAddr, Hits, tokio::task::JoinHandle<()>) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/api/gamelist", get(game_list))
        .route("/api/download/:id", get(download))
        .route("/api/download/banner/:id", get(banner))
        .route("/api/download/icon/:id", get(banner))
        .with_state(hits.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits, handle)
}

/// Channel whose backend answers every ping and acknowledges everything else.
fn answering_channel() -> ChannelClient {
    let (client_io, backend_io) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(client_io);
    let client = ChannelClient::from_streams(read, write, ChannelOptions::default());

    tokio::spawn(async move {
        let (b_read, mut b_write) = tokio::io::split(backend_io);
        let mut lines = BufReader::new(b_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(req) = serde_json::from_str::<Request>(&line) else {
                continue;
            };
            let body = match req.body {
                RequestBody::Ping => ResponseBody::Pong,
                _ => ResponseBody::Ok,
            };
            let res = Response {
                request_id: req.request_id,
                body,
            };
            if b_write.write_all(res.to_line().unwrap().as_bytes()).await.is_err() {
                break;
            }
        }
    });
    client
}

#[tokio::test]
async fn test_reqwest_transport_sends_bearer_token() {
    let (addr, hits, _handle) = start_server().await;
    let base = format!("http://{addr}/api");

    let authed = Arc::new(ReqwestTransport::new(Some(TOKEN.to_string())).unwrap());
    let api = CatalogApi::new(
        base.clone(),
        Arc::new(DownloadArbiter::new(authed, 3, 10, Duration::from_millis(100))),
    );
    let games = api.game_list().await.unwrap();
    assert_eq!(games.len(), 3);
    assert_eq!(hits.list.load(Ordering::SeqCst), 1);

    let anonymous = Arc::new(ReqwestTransport::new(None).unwrap());
    let api = CatalogApi::new(
        base,
        Arc::new(DownloadArbiter::new(anonymous, 3, 10, Duration::from_millis(100))),
    );
    let err = api.game_list().await.unwrap_err();
    assert!(matches!(err, OnboardError::Connectivity(msg) if msg.contains("401")));
}

#[tokio::test]
async fn test_context_loads_catalog_and_fetches_artwork() {
    let (addr, hits, _handle) = start_server().await;
    let tmp = tempfile::tempdir().unwrap();
    let api_url = format!("http://{addr}/api");
    let base = tmp.path().display().to_string();
    let config = OnboardConfig::from_lookup(|k| match k {
        "ARCADE_API_URL" => Some(api_url.clone()),
        "ARCADE_API_TOKEN" => Some(TOKEN.to_string()),
        "ARCADE_PATH" => Some(base.clone()),
        _ => None,
    });

    let transport = Arc::new(ReqwestTransport::new(config.api_token.clone()).unwrap());
    let ctx = OnboardContext::with_parts(config, answering_channel(), transport)
        .await
        .unwrap();

    assert_eq!(ctx.catalog.source(), CatalogSource::Remote);
    assert_eq!(hits.list.load(Ordering::SeqCst), 1);
    // Older "Snake" upload dropped.
    assert_eq!(ctx.catalog.len(), 2);
    assert_eq!(ctx.catalog.by_name("Snake").unwrap().game().id.0, "g1");

    for task in ctx.prefetch_artwork() {
        task.await.unwrap();
    }
    let snake = ctx.catalog.by_id("g1").unwrap();
    assert_eq!(snake.banner(), Some(tmp.path().join("Snake/banner.png").as_path()));
    assert!(snake.icon().is_some());
    let tetris = ctx.catalog.by_id("g2").unwrap();
    assert!(tetris.banner().is_none());

    assert!(matches!(
        ctx.launch_by_id("nope").await,
        Err(OnboardError::UnknownGame(_))
    ));

    ctx.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_launch_by_id_downloads_once_and_kills() {
    let (addr, hits, _handle) = start_server().await;
    let tmp = tempfile::tempdir().unwrap();
    let api_url = format!("http://{addr}/api");
    let base = tmp.path().display().to_string();
    let config = OnboardConfig::from_lookup(|k| match k {
        "ARCADE_API_URL" => Some(api_url.clone()),
        "ARCADE_API_TOKEN" => Some(TOKEN.to_string()),
        "ARCADE_PATH" => Some(base.clone()),
        "ARCADE_KILL_GRACE_MS" => Some("2000".to_string()),
        _ => None,
    });

    let transport = Arc::new(ReqwestTransport::new(config.api_token.clone()).unwrap());
    let ctx = OnboardContext::with_parts(config, answering_channel(), transport)
        .await
        .unwrap();

    let status = ctx.launch_by_id("g1").await.unwrap();
    assert_eq!(status.stage, GameStage::Running);
    assert!(ctx.lifecycle.is_running("Snake"));
    assert_eq!(
        std::fs::read(tmp.path().join("Snake/publish/assets/level1.txt")).unwrap(),
        b"#####\n#...#\n#####\n"
    );
    assert!(tmp.path().join("Snake/Snake.json").is_file());

    assert!(ctx.lifecycle.kill("Snake").await);
    assert!(!ctx.lifecycle.is_running("Snake"));

    // Relaunch hits the cache.
    ctx.launch_by_id("g1").await.unwrap();
    assert_eq!(hits.archive.load(Ordering::SeqCst), 1);

    ctx.shutdown().await;
    assert!(!ctx.lifecycle.is_running("Snake"));
}
