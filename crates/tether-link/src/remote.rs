//! Outbound connection to the cloud node.
//!
//! One persistent TCP socket, owned by [`RemoteConnection`]. A receive task
//! reads frames and resolves pending requests by correlation id; anything
//! else is queued for the unsolicited handler, which sees envelopes one at a
//! time in arrival order. A writer task owns the write half, so a stalled
//! peer only delays callers up to their own deadline and never blocks
//! `close()`. The maintain loop reconnects with exponential backoff and the
//! heartbeat loop reports liveness on a fixed interval. Both loops stop at
//! their next wait point once `close()` runs.
//!
//! State: Disconnected → Connecting → Connected → Disconnected. Every
//! connect/disconnect transition happens under `conn_lock`. Each successful
//! connect bumps `epoch`, so a receive task that outlived its socket cannot
//! tear down a newer connection.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use tether_core::config::TetherConfig;
use tether_core::message::{
    ConfidentResultNotification, Heartbeat, HeartbeatStatus, Message, RefinementRequest,
    RefinementResponse,
};
use tether_core::wire::{decode_line, encode_frame, FrameDecoder, READ_CHUNK};
use tether_core::Envelope;

use crate::error::LinkError;

/// Called with every envelope that matches no pending request.
pub type UnsolicitedHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;
/// Called once per disconnection event.
pub type DisconnectHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
/// Generation backend health, polled before each heartbeat.
pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;
/// Active task count, read before each heartbeat.
pub type TaskCountProbe = Arc<dyn Fn() -> usize + Send + Sync>;

type PendingSlot = oneshot::Sender<Result<Envelope, LinkError>>;
type WriteJob = (Bytes, oneshot::Sender<io::Result<()>>);

/// Frames queued for the writer task before senders wait.
const WRITE_QUEUE: usize = 64;
/// Floor for the heartbeat period; `interval` rejects zero.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything the connection needs from configuration.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub host: String,
    pub port: u16,
    pub node_id: String,
    pub model_name: Option<String>,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl LinkSettings {
    pub fn from_config(config: &TetherConfig) -> Self {
        Self {
            host: config.remote.host.clone(),
            port: config.remote.port,
            node_id: config.node.node_id.clone(),
            model_name: Some(config.generation.model.clone()),
            request_timeout: config.remote.cloud_request_timeout(),
            heartbeat_interval: config.remote.heartbeat_interval(),
            reconnect_delay: config.remote.reconnect_delay(),
            max_reconnect_delay: config.remote.max_reconnect_delay(),
            connect_timeout: config.remote.connect_timeout(),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Backoff ───────────────────────────────────────────────────────────────────

/// Doubling delay, capped at `ceiling`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(initial);
        Self {
            initial,
            ceiling,
            current: initial,
        }
    }

    /// Delay the next failed attempt would wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Take the current delay and double it for the attempt after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Cause {
    /// The receive task for this epoch saw EOF or a read fault.
    Reader(u64),
    /// A write on this epoch's socket failed.
    Writer(u64),
    Close,
}

/// Sending side of one epoch's writer task.
struct WriterLink {
    epoch: u64,
    jobs: mpsc::Sender<WriteJob>,
    task: JoinHandle<()>,
}

struct Inner {
    settings: LinkSettings,
    conn_lock: Mutex<()>,
    writer: StdMutex<Option<WriterLink>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    epoch: AtomicU64,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    pending: DashMap<String, PendingSlot>,
    backoff: StdMutex<Backoff>,
    heartbeat_task: StdMutex<Option<JoinHandle<()>>>,
    maintain_task: StdMutex<Option<JoinHandle<()>>>,
    on_unsolicited: RwLock<Option<UnsolicitedHandler>>,
    on_disconnect: RwLock<Option<DisconnectHandler>>,
}

/// Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct RemoteConnection {
    inner: Arc<Inner>,
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RemoteConnection {
    pub fn new(settings: LinkSettings) -> Self {
        let backoff = Backoff::new(settings.reconnect_delay, settings.max_reconnect_delay);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                settings,
                conn_lock: Mutex::new(()),
                writer: StdMutex::new(None),
                reader: StdMutex::new(None),
                epoch: AtomicU64::new(0),
                state,
                shutdown,
                closed: AtomicBool::new(false),
                pending: DashMap::new(),
                backoff: StdMutex::new(backoff),
                heartbeat_task: StdMutex::new(None),
                maintain_task: StdMutex::new(None),
                on_unsolicited: RwLock::new(None),
                on_disconnect: RwLock::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.inner.settings
    }

    pub fn set_unsolicited_handler(&self, handler: UnsolicitedHandler) {
        *self
            .inner
            .on_unsolicited
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn set_disconnect_handler(&self, handler: DisconnectHandler) {
        *self
            .inner
            .on_disconnect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Backoff delay the next failed reconnect would wait.
    pub fn reconnect_delay(&self) -> Duration {
        lock(&self.inner.backoff).current()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// One connection attempt. Never fails loudly: refusal, timeout and OS
    /// errors are logged and reported as `false`.
    pub async fn connect(&self) -> bool {
        if self.is_shut_down() {
            return false;
        }
        let _guard = self.inner.conn_lock.lock().await;
        if self.is_connected() {
            return true;
        }

        let addr = self.inner.settings.addr();
        self.inner.state.send_replace(ConnectionState::Connecting);
        tracing::debug!(%addr, "connecting to cloud node");

        let attempt =
            tokio::time::timeout(self.inner.settings.connect_timeout, TcpStream::connect(&addr)).await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(%addr, error = %e, "connect to cloud node failed");
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return false;
            }
            Err(_) => {
                tracing::warn!(%addr, timeout = ?self.inner.settings.connect_timeout, "connect to cloud node timed out");
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return false;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }

        let (read, write) = stream.into_split();
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (jobs, queue) = mpsc::channel(WRITE_QUEUE);
        let link = WriterLink {
            epoch,
            jobs,
            task: tokio::spawn(write_loop(write, queue)),
        };
        if let Some(stale) = lock(&self.inner.writer).replace(link) {
            stale.task.abort();
        }
        let reader = tokio::spawn(self.clone().receive_loop(read, epoch));
        if let Some(stale) = lock(&self.inner.reader).replace(reader) {
            stale.abort();
        }
        lock(&self.inner.backoff).reset();
        self.inner.state.send_replace(ConnectionState::Connected);

        tracing::info!(%addr, epoch, "connected to cloud node");
        true
    }

    /// Send a heartbeat, building the default one when none is given.
    /// Returns false when disconnected or when the write fails.
    pub async fn send_heartbeat(&self, heartbeat: Option<Heartbeat>) -> bool {
        if !self.is_connected() {
            tracing::debug!("heartbeat skipped: not connected");
            return false;
        }
        let heartbeat = heartbeat.unwrap_or_else(|| self.default_heartbeat());
        self.send_message(Message::Heartbeat(heartbeat), "heartbeat").await
    }

    /// Fire-and-forget. No pending slot is registered.
    pub async fn send_confident_result_notification(
        &self,
        notification: ConfidentResultNotification,
    ) -> bool {
        if !self.is_connected() {
            tracing::debug!("confident result notification skipped: not connected");
            return false;
        }
        self.send_message(Message::ConfidentResult(notification), "confident result")
            .await
    }

    /// Send a refinement request and wait for the matching response.
    ///
    /// Resolves on the first envelope carrying the request's correlation id,
    /// fails on `timeout` (or the configured default), and fails with
    /// [`LinkError::ConnectionLost`] if the socket drops first. The deadline
    /// covers writing the request as well as waiting for the reply. The
    /// pending entry is removed on every exit path.
    pub async fn request_cloud_refinement(
        &self,
        request: RefinementRequest,
        timeout: Option<Duration>,
    ) -> Result<RefinementResponse, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let envelope = Envelope::from_message(&Message::RefinementRequest(request))?;
        let correlation_id = envelope.correlation_id.clone();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id.clone(), tx);
        let _slot = PendingGuard {
            pending: &self.inner.pending,
            id: correlation_id.clone(),
        };

        let wait = timeout.unwrap_or(self.inner.settings.request_timeout);
        let outcome = tokio::time::timeout(wait, self.exchange(&envelope, rx)).await;
        let reply = match outcome {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(%correlation_id, timeout = ?wait, "refinement request timed out");
                return Err(LinkError::Timeout {
                    correlation_id,
                    timeout: wait,
                });
            }
        };

        match reply.message() {
            Ok(Message::RefinementResponse(response)) => Ok(response),
            Ok(Message::Error(report)) => Err(LinkError::Rejected {
                correlation_id,
                error: match report.details {
                    Some(details) => format!("{}: {details}", report.error),
                    None => report.error,
                },
            }),
            Ok(other) => Err(LinkError::InvalidResponse {
                correlation_id,
                reason: format!("unexpected message_type {}", other.kind()),
            }),
            Err(e) => Err(LinkError::InvalidResponse {
                correlation_id,
                reason: e.to_string(),
            }),
        }
    }

    /// Reconnect loop. Runs until `close()`.
    pub async fn maintain_connection_loop(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut state = self.inner.state.subscribe();

        loop {
            if self.is_shut_down() {
                break;
            }
            if self.is_connected() {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    _ = wait_for_disconnect(&mut state) => continue,
                }
            }
            if self.connect().await {
                continue;
            }

            let delay = lock(&self.inner.backoff).next_delay();
            tracing::info!(delay_ms = delay.as_millis() as u64, "cloud node unreachable, retrying");
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!("maintain loop stopped");
    }

    /// Run the maintain loop as a background task owned by this connection.
    pub fn spawn_maintain_loop(&self) {
        let conn = self.clone();
        let handle = tokio::spawn(async move { conn.maintain_connection_loop().await });
        if let Some(old) = lock(&self.inner.maintain_task).replace(handle) {
            old.abort();
        }
    }

    /// Start the heartbeat loop in the background. The probes, when given,
    /// fill the heartbeat's telemetry fields.
    pub fn start_heartbeat_loop(
        &self,
        health_check: Option<HealthProbe>,
        active_tasks: Option<TaskCountProbe>,
    ) {
        let conn = self.clone();
        let handle =
            tokio::spawn(async move { conn.heartbeat_loop(health_check, active_tasks).await });
        if let Some(old) = lock(&self.inner.heartbeat_task).replace(handle) {
            old.abort();
        }
    }

    /// Stop every loop, fail pending requests, close the socket. Idempotent.
    /// Returns once no loop owned by this connection is still running.
    pub async fn close(&self) {
        let first = !self.inner.closed.swap(true, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        let loops = [
            lock(&self.inner.heartbeat_task).take(),
            lock(&self.inner.maintain_task).take(),
        ];
        for task in loops.into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }

        self.disconnect(Cause::Close, "connection closed").await;
        if first {
            tracing::info!("remote connection closed");
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn default_heartbeat(&self) -> Heartbeat {
        Heartbeat::ok(
            self.inner.settings.node_id.clone(),
            self.inner.settings.model_name.clone(),
        )
    }

    /// Write `envelope`, then wait for the reply routed to `rx`.
    async fn exchange(
        &self,
        envelope: &Envelope,
        rx: oneshot::Receiver<Result<Envelope, LinkError>>,
    ) -> Result<Envelope, LinkError> {
        self.send_envelope(envelope).await?;
        tracing::debug!(correlation_id = %envelope.correlation_id, "refinement request sent");
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(LinkError::ConnectionLost(envelope.correlation_id.clone())),
        }
    }

    /// Bounded by the request timeout.
    async fn send_message(&self, message: Message, what: &'static str) -> bool {
        let envelope = match Envelope::from_message(&message) {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(error = %e, what, "refusing to send invalid message");
                return false;
            }
        };
        let wait = self.inner.settings.request_timeout;
        match tokio::time::timeout(wait, self.send_envelope(&envelope)).await {
            Ok(Ok(())) => {
                tracing::trace!(what, correlation_id = %envelope.correlation_id, "sent");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, what, "send failed");
                false
            }
            Err(_) => {
                tracing::warn!(what, timeout = ?wait, "send timed out");
                false
            }
        }
    }

    /// Queue one frame for the writer task and wait until it is flushed.
    /// A write fault drops the connection. Cancelling the caller leaves the
    /// frame with the writer, so the stream never carries half a frame.
    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), LinkError> {
        let frame = encode_frame(envelope).map_err(|e| LinkError::SendFailed(e.to_string()))?;
        let (epoch, jobs) = match lock(&self.inner.writer).as_ref() {
            Some(link) => (link.epoch, link.jobs.clone()),
            None => return Err(LinkError::NotConnected),
        };

        let (done, written) = oneshot::channel();
        if jobs.send((frame, done)).await.is_err() {
            self.disconnect(Cause::Writer(epoch), "writer stopped").await;
            return Err(LinkError::SendFailed("connection writer stopped".into()));
        }
        match written.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.disconnect(Cause::Writer(epoch), "write failed").await;
                Err(LinkError::SendFailed(e.to_string()))
            }
            Err(_) => Err(LinkError::SendFailed("connection closed before the frame was written".into())),
        }
    }

    async fn receive_loop(self, mut read: OwnedReadHalf, epoch: u64) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut shutdown = self.inner.shutdown.subscribe();
        let (unsolicited, queue) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().deliver_unsolicited(queue));

        let reason = 'read: loop {
            let n = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return,
                r = read.read(&mut buf) => match r {
                    Ok(0) => break 'read "peer closed the connection".to_string(),
                    Ok(n) => n,
                    Err(e) => break 'read format!("read failed: {e}"),
                },
            };
            decoder.extend(&buf[..n]);
            while let Some(line) = decoder.next_line() {
                match line {
                    Ok(line) => self.dispatch(&line, &unsolicited),
                    Err(e) if e.is_unrecoverable() => break 'read e.to_string(),
                    Err(e) => tracing::warn!(error = %e, "dropping unreadable frame from cloud"),
                }
            }
        };

        self.disconnect(Cause::Reader(epoch), &reason).await;
    }

    fn dispatch(&self, line: &str, unsolicited: &mpsc::UnboundedSender<Envelope>) {
        tracing::trace!(len = line.len(), "frame from cloud");
        let envelope = match decode_line(line) {
            Ok(env) => env,
            Err(e) => {
                // A pending request whose reply is invalid fails now instead of timing out.
                if let Some((id, slot)) = e.correlation_id().and_then(|id| self.inner.pending.remove(id)) {
                    let _ = slot.send(Err(LinkError::InvalidResponse {
                        correlation_id: id,
                        reason: e.to_string(),
                    }));
                    return;
                }
                tracing::warn!(error = %e, correlation_id = ?e.correlation_id(), "dropping invalid message from cloud");
                return;
            }
        };

        if let Some((_, slot)) = self.inner.pending.remove(&envelope.correlation_id) {
            let _ = slot.send(Ok(envelope));
            return;
        }
        let _ = unsolicited.send(envelope);
    }

    /// Hands queued unsolicited envelopes to the handler one at a time.
    /// Ends once the receive task drops its sender or `close()` runs.
    async fn deliver_unsolicited(self, mut queue: mpsc::UnboundedReceiver<Envelope>) {
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let envelope = tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                next = queue.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let handler = self
                .inner
                .on_unsolicited
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match handler {
                Some(handler) => handler(envelope).await,
                None => tracing::info!(
                    kind = %envelope.kind,
                    correlation_id = %envelope.correlation_id,
                    "unsolicited message from cloud dropped"
                ),
            }
        }
    }

    async fn disconnect(&self, cause: Cause, reason: &str) {
        let (was_connected, reader, writer) = {
            let _guard = self.inner.conn_lock.lock().await;
            let current = self.inner.epoch.load(Ordering::SeqCst);
            let was_connected = self.is_connected();
            match cause {
                Cause::Reader(epoch) | Cause::Writer(epoch) if epoch != current || !was_connected => {
                    return;
                }
                _ => {}
            }

            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            self.inner.state.send_replace(ConnectionState::Disconnected);
            let writer = lock(&self.inner.writer).take();
            let reader = lock(&self.inner.reader).take();
            let failed = self.fail_pending();
            if was_connected {
                tracing::warn!(reason, failed_requests = failed, "disconnected from cloud node");
            }
            (was_connected, reader, writer)
        };

        // A writer stuck on a peer that stopped reading is cut off here.
        if let Some(writer) = writer {
            writer.task.abort();
            if matches!(cause, Cause::Close) {
                let _ = writer.task.await;
            }
        }

        if let Some(reader) = reader {
            match cause {
                // Running inside that task; dropping the handle detaches it.
                Cause::Reader(_) => {}
                Cause::Writer(_) => reader.abort(),
                Cause::Close => {
                    reader.abort();
                    let _ = reader.await;
                }
            }
        }

        if was_connected {
            let handler = self
                .inner
                .on_disconnect
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(handler) = handler {
                handler().await;
            }
        }
    }

    fn fail_pending(&self) -> usize {
        let ids: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((id, slot)) = self.inner.pending.remove(&id) {
                let _ = slot.send(Err(LinkError::ConnectionLost(id)));
                failed += 1;
            }
        }
        failed
    }

    async fn heartbeat_loop(
        &self,
        health_check: Option<HealthProbe>,
        active_tasks: Option<TaskCountProbe>,
    ) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.inner.settings.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the first heartbeat waits one interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            if !self.is_connected() {
                continue;
            }

            let mut heartbeat = self.default_heartbeat();
            if let Some(probe) = &health_check {
                let healthy = probe().await;
                heartbeat.backend_healthy = Some(healthy);
                if !healthy {
                    heartbeat.status = HeartbeatStatus::Warning;
                }
            }
            if let Some(count) = &active_tasks {
                heartbeat.active_tasks_count = Some(count() as u64);
            }
            self.send_heartbeat(Some(heartbeat)).await;
        }
        tracing::debug!("heartbeat loop stopped");
    }
}

/// Removes the pending slot however the request future exits.
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingSlot>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Owns the write half of one connection. Stops after the first failed
/// write or when every sender is gone.
async fn write_loop(mut write: OwnedWriteHalf, mut jobs: mpsc::Receiver<WriteJob>) {
    while let Some((frame, done)) = jobs.recv().await {
        let result = match write.write_all(&frame).await {
            Ok(()) => write.flush().await,
            Err(e) => Err(e),
        };
        let failed = result.is_err();
        let _ = done.send(result);
        if failed {
            return;
        }
    }
    let _ = write.shutdown().await;
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_disconnect(rx: &mut watch::Receiver<ConnectionState>) {
    loop {
        if *rx.borrow_and_update() == ConnectionState::Disconnected {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
