//! Correlated request/response client for the backend channel.
//!
//! Requests are written as one JSON line each. A single reader task resolves replies by
//! `request_id`, so the backend may answer out of order. Every in-flight call owns a slot
//! in the pending table until its reply arrives, it times out, or its handle is dropped.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use arcade_types::{Game, Request, RequestBody, Response, ResponseBody, Tag, User};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::Instrument;

use crate::config::ChannelEndpoint;
use crate::error::{OnboardError, Result};

type Reply = Result<ResponseBody>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub call_timeout: Duration,
    pub first_request_id: u32,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            first_request_id: 0,
        }
    }
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u32, oneshot::Sender<Reply>>>,
    closed: AtomicBool,
    connected: AtomicBool,
    production: AtomicBool,
}

impl Shared {
    fn remove(&self, id: u32) -> Option<oneshot::Sender<Reply>> {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&id)
    }

    /// Inserts a pending slot unless the reader has already drained the table.
    fn register(&self, id: u32, tx: oneshot::Sender<Reply>) -> Result<()> {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return Err(OnboardError::Connectivity("channel closed".to_string()));
        }
        map.insert(id, tx);
        Ok(())
    }

    fn close(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let drained: Vec<_> = {
            // `closed` flips under the table lock so `register` cannot slip in after the drain.
            let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            self.closed.store(true, Ordering::SeqCst);
            map.drain().collect()
        };
        for (id, tx) in drained {
            tracing::debug!(request_id = id, "failing pending call: channel closed");
            let _ = tx.send(Err(OnboardError::Connectivity(reason.to_string())));
        }
    }
}

/// Handle to one in-flight call. Dropping it abandons the call and frees its slot.
pub struct PendingResponse {
    id: u32,
    rx: oneshot::Receiver<Reply>,
    shared: Arc<Shared>,
}

impl PendingResponse {
    pub fn request_id(&self) -> u32 {
        self.id
    }

    pub async fn recv(mut self) -> Result<ResponseBody> {
        match (&mut self.rx).await {
            Ok(reply) => reply,
            Err(_) => Err(OnboardError::Connectivity("channel closed".to_string())),
        }
    }

    pub async fn recv_timeout(mut self, timeout: Duration) -> Result<ResponseBody> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(OnboardError::Connectivity("channel closed".to_string())),
            Err(_) => {
                tracing::warn!(request_id = self.id, "backend call timed out");
                Err(OnboardError::Timeout { request_id: self.id })
            }
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // No-op when the reader already resolved this id.
        self.shared.remove(self.id);
    }
}

#[derive(Clone)]
pub struct ChannelClient {
    next_id: Arc<AtomicU32>,
    writer: Arc<tokio::sync::Mutex<Writer>>,
    shared: Arc<Shared>,
    reader: Arc<JoinHandle<()>>,
    call_timeout: Duration,
}

impl ChannelClient {
    /// Connects to the backend. There is no reconnect path; callers treat an error here as
    /// fatal.
    pub async fn open(endpoint: &ChannelEndpoint, options: ChannelOptions) -> Result<Self> {
        match endpoint {
            ChannelEndpoint::Socket(path) => {
                let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                    OnboardError::Connectivity(format!("connect {}: {e}", path.display()))
                })?;
                tracing::info!(socket = %path.display(), "opened backend channel");
                let (read, write) = stream.into_split();
                Ok(Self::from_streams(read, write, options))
            }
            ChannelEndpoint::Pipes { command, response } => {
                use tokio::net::unix::pipe;

                let read = pipe::OpenOptions::new().open_receiver(response).map_err(|e| {
                    OnboardError::Connectivity(format!("open {}: {e}", response.display()))
                })?;
                let write = pipe::OpenOptions::new().open_sender(command).map_err(|e| {
                    OnboardError::Connectivity(format!("open {}: {e}", command.display()))
                })?;
                tracing::info!(
                    command = %command.display(),
                    response = %response.display(),
                    "opened backend pipes"
                );
                Ok(Self::from_streams(read, write, options))
            }
        }
    }

    /// Wraps an already-open stream pair and starts the reader task.
    pub fn from_streams<R, W>(reader: R, writer: W, options: ChannelOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::default());
        let reader = tokio::spawn(
            read_loop(reader, shared.clone()).instrument(tracing::info_span!("channel_reader")),
        );
        Self {
            next_id: Arc::new(AtomicU32::new(options.first_request_id)),
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            shared,
            reader: Arc::new(reader),
            call_timeout: options.call_timeout,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Result of the most recent heartbeat.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_production(&self) -> bool {
        self.shared.production.load(Ordering::SeqCst)
    }

    pub fn pending_calls(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn has_pending(&self, request_id: u32) -> bool {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&request_id)
    }

    /// Sends one request and returns a handle for its reply.
    pub async fn call(&self, body: RequestBody) -> Result<PendingResponse> {
        if self.is_closed() {
            return Err(OnboardError::Connectivity("channel closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel::<Reply>();
        self.shared.register(id, tx)?;
        // From here on the slot is released by the handle's Drop on every path.
        let pending = PendingResponse {
            id,
            rx,
            shared: self.shared.clone(),
        };

        let request = Request { request_id: id, body };
        let line = request.to_line()?;
        if matches!(request.body, RequestBody::Ping) {
            tracing::trace!(request_id = id, "sending ping");
        } else {
            tracing::debug!(request_id = id, op = request.body.name(), "sending request");
        }

        let mut writer = self.writer.lock().await;
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::error!(request_id = id, error = %e, "failed to write request");
            return Err(OnboardError::Connectivity(format!("write request {id}: {e}")));
        }

        Ok(pending)
    }

    /// Sends one request and waits for its reply, bounded by `timeout`.
    pub async fn call_with_timeout(
        &self,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<ResponseBody> {
        let reply = self.call(body).await?.recv_timeout(timeout).await?;
        match reply {
            ResponseBody::Err(msg) => Err(OnboardError::Backend(msg)),
            other => Ok(other),
        }
    }

    pub async fn request(&self, body: RequestBody) -> Result<ResponseBody> {
        self.call_with_timeout(body, self.call_timeout).await
    }

    pub async fn ping(&self) -> Result<()> {
        match self.request(RequestBody::Ping).await? {
            ResponseBody::Pong => Ok(()),
            other => Err(unexpected("Pong", &other)),
        }
    }

    pub async fn game_list(&self) -> Result<Vec<Game>> {
        expect_game_list(self.request(RequestBody::GetGameList).await?)
    }

    pub async fn game_list_from_fs(&self) -> Result<Vec<Game>> {
        expect_game_list(self.request(RequestBody::GetGameListFromFs).await?)
    }

    pub async fn game(&self, id: &str) -> Result<Game> {
        match self.request(RequestBody::GetGame(id.to_string())).await? {
            ResponseBody::Game(game) => Ok(game),
            other => Err(unexpected("Game", &other)),
        }
    }

    pub async fn download_game(&self, id: &str) -> Result<()> {
        expect_ok(self.request(RequestBody::DownloadGame(id.to_string())).await?)
    }

    pub async fn download_banner(&self, id: &str) -> Result<()> {
        expect_ok(self.request(RequestBody::DownloadBanner(id.to_string())).await?)
    }

    pub async fn download_icon(&self, id: &str) -> Result<()> {
        expect_ok(self.request(RequestBody::DownloadIcon(id.to_string())).await?)
    }

    pub async fn tag_list(&self) -> Result<Vec<Tag>> {
        match self.request(RequestBody::GetTagList).await? {
            ResponseBody::TagList(tags) => Ok(tags),
            other => Err(unexpected("TagList", &other)),
        }
    }

    pub async fn tag(&self, name: &str) -> Result<Tag> {
        match self.request(RequestBody::GetTag(name.to_string())).await? {
            ResponseBody::Tag(tag) => Ok(tag),
            other => Err(unexpected("Tag", &other)),
        }
    }

    pub async fn games_with_tag(&self, name: &str) -> Result<Vec<Game>> {
        expect_game_list(
            self.request(RequestBody::GetGameListFromTag(name.to_string()))
                .await?,
        )
    }

    pub async fn user(&self, id: &str) -> Result<User> {
        match self.request(RequestBody::GetUser(id.to_string())).await? {
            ResponseBody::User(user) => Ok(user),
            other => Err(unexpected("User", &other)),
        }
    }

    pub async fn set_production(&self, production: bool) -> Result<()> {
        tracing::info!(production, "setting backend catalog mode");
        expect_ok(self.request(RequestBody::SetProduction(production)).await?)?;
        self.shared.production.store(production, Ordering::SeqCst);
        Ok(())
    }

    pub async fn launch_game(&self, id: &str) -> Result<()> {
        expect_ok(self.request(RequestBody::LaunchGame(id.to_string())).await?)
    }

    pub async fn kill_game(&self) -> Result<()> {
        expect_ok(self.request(RequestBody::KillGame).await?)
    }

    /// Pings the backend every `interval` and records whether it answered within
    /// `timeout`. Stops once the channel closes.
    pub fn spawn_heartbeat(&self, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(
            async move {
                loop {
                    if client.is_closed() {
                        break;
                    }
                    let started = tokio::time::Instant::now();
                    let res = match client.call(RequestBody::Ping).await {
                        Ok(pending) => pending.recv_timeout(timeout).await,
                        Err(e) => Err(e),
                    };
                    match res {
                        Ok(ResponseBody::Pong) => {
                            tracing::trace!(
                                latency_ms = started.elapsed().as_millis() as u64,
                                "ping ok"
                            );
                            client.shared.connected.store(true, Ordering::SeqCst);
                        }
                        Ok(other) => {
                            tracing::warn!(kind = other.kind(), "unexpected reply to ping");
                            client.shared.connected.store(false, Ordering::SeqCst);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to ping backend");
                            client.shared.connected.store(false, Ordering::SeqCst);
                        }
                    }
                    tokio::time::sleep(interval).await;
                }
            }
            .instrument(tracing::info_span!("channel_heartbeat")),
        )
    }

    /// Stops the reader and fails every pending call.
    pub fn shutdown(&self) {
        self.reader.abort();
        self.shared.close("channel shut down");
    }
}

fn unexpected(expected: &str, got: &ResponseBody) -> OnboardError {
    OnboardError::Protocol(format!("expected {expected} response, got {}", got.kind()))
}

fn expect_ok(body: ResponseBody) -> Result<()> {
    match body {
        ResponseBody::Ok => Ok(()),
        other => Err(unexpected("Ok", &other)),
    }
}

fn expect_game_list(body: ResponseBody) -> Result<Vec<Game>> {
    match body {
        ResponseBody::GameList(games) => Ok(games),
        other => Err(unexpected("GameList", &other)),
    }
}

async fn read_loop<R>(reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break "backend closed the channel".to_string(),
            Err(e) => break format!("read failed: {e}"),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match Response::from_line(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed response line");
                continue;
            }
        };

        let id = response.request_id;
        let Some(tx) = shared.remove(id) else {
            tracing::warn!(
                request_id = id,
                kind = response.body.kind(),
                "discarding unmatched response"
            );
            continue;
        };

        match &response.body {
            ResponseBody::Pong => tracing::trace!(request_id = id, "received pong"),
            ResponseBody::Err(msg) => {
                tracing::error!(request_id = id, error = %msg, "received error response")
            }
            ResponseBody::GameList(games) => {
                tracing::debug!(request_id = id, games = games.len(), "received game list")
            }
            ResponseBody::TagList(tags) => {
                tracing::debug!(request_id = id, tags = tags.len(), "received tag list")
            }
            other => tracing::debug!(request_id = id, kind = other.kind(), "received response"),
        }

        // The caller may have given up already; nothing to do then.
        let _ = tx.send(Ok(response.body));
    };

    tracing::error!(reason = %reason, "backend channel reader stopped");
    shared.close(&reason);
}
