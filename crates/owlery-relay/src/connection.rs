//! Per-relay socket state machine.
//!
//! One `RelayConnection` owns one WebSocket to one relay: connect with
//! exponential skip-count backoff, NIP-42 challenge/response auth, an
//! ordered outbound queue with an auth bypass lane, and ping/keepalive.
//!
//! # Architecture
//!
//! Every connection runs as an owned task. The [`RelayConnection`] handle
//! is cheap to clone around; it feeds commands into the task over a
//! channel, and the task serializes all state transitions — backoff
//! counters, auth state, the socket itself — so nothing outside the task
//! can race them. Cross-task observables (`is_connected`, the active
//! subscription set) live in shared atomics/mutexes next to the handle.
//!
//! Reconnection is driven from the outside: the pool's keepalive tick
//! calls `connect()` on standing connections that dropped, and the skip
//! gate decides whether an attempt actually goes out.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use nostr::{Event, EventBuilder, RelayUrl};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use owlery_core::{CanonicalRelayUrl, ClientMessage, RelayDescriptor, RelayMessage};

use crate::pool::PoolNotification;
use crate::reachability::NetworkState;
use crate::stats::ConnectionStats;
use crate::traits::Signer;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Cap for the exponential reconnect backoff counter.
const MAX_BACKOFF: u32 = 512;

/// Socket establishment deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum spacing between auth responses to one relay. Relays that spray
/// challenges get at most one signature per window.
const AUTH_THROTTLE: Duration = Duration::from_millis(5500);

/// Which registry a connection belongs to. Determines penalty-box
/// eligibility: relays the user explicitly configured are never boxed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// User-configured relay set.
    Primary,
    /// Opened by the outbox extension.
    Outbox,
    /// Short-lived one-off fetch connection.
    Ephemeral,
    /// Signer/wallet relay with its own dispatch rules.
    Service,
}

impl ConnectionKind {
    pub fn penalty_eligible(self) -> bool {
        matches!(self, Self::Outbox | Self::Ephemeral)
    }
}

/// Why a relay was proposed for the penalty box. The three heuristics are
/// deliberately independent: they guard against different failure
/// patterns (certificate/DNS breakage, a relay that never worked, a flaky
/// relay while the rest of the network is fine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyReason {
    /// TLS/DNS/bad-HTTP-response class failure with no prior success.
    FatalTransport,
    /// Three or more errors accumulated without a single successful connect.
    NeverConnected,
    /// Repeated transient failures while other relays are connected.
    FailingWhileOthersConnected,
}

/// Registry-wide signals shared between a pool and its connections:
/// the connected count (backoff growth is gated on *other* relays being
/// up) and the penalty-candidate channel back to the pool.
#[derive(Debug)]
pub(crate) struct PoolSignals {
    connected_count: AtomicUsize,
    penalty_tx: mpsc::UnboundedSender<(CanonicalRelayUrl, PenaltyReason)>,
}

impl PoolSignals {
    pub(crate) fn new(
        penalty_tx: mpsc::UnboundedSender<(CanonicalRelayUrl, PenaltyReason)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connected_count: AtomicUsize::new(0),
            penalty_tx,
        })
    }

    pub(crate) fn any_connected(&self) -> bool {
        self.connected_count.load(Ordering::Relaxed) > 0
    }

    fn connection_up(&self) {
        self.connected_count.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_down(&self) {
        let _ = self
            .connected_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });
    }

    fn report_penalty(&self, url: CanonicalRelayUrl, reason: PenaltyReason) {
        let _ = self.penalty_tx.send((url, reason));
    }
}

/// Reconnect gate: exponential backoff counted in *suppressed attempts*
/// rather than wall-clock time. `skipped` must climb to the current
/// `backoff` before an attempt is let through.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BackoffGate {
    backoff: u32,
    skipped: u32,
}

impl BackoffGate {
    /// Returns true when a connect attempt may proceed. Counts a skip
    /// otherwise. Any allowed attempt resets the skip counter.
    pub(crate) fn allow_attempt(&mut self, force: bool) -> bool {
        if !force && self.backoff > 0 && self.skipped < self.backoff {
            self.skipped += 1;
            return false;
        }
        self.skipped = 0;
        true
    }

    /// A connect attempt failed. Backoff only grows while at least one
    /// other relay is connected; during a full outage it stays put so a
    /// network flap does not leave every relay with a runaway counter.
    pub(crate) fn record_failure(&mut self, others_connected: bool) {
        if others_connected {
            self.backoff = self.backoff.saturating_mul(2).clamp(1, MAX_BACKOFF);
        }
    }

    /// Fast recovery: any received message or pong clears the gate.
    pub(crate) fn record_success(&mut self) {
        self.backoff = 0;
        self.skipped = 0;
    }

    pub(crate) fn backoff(&self) -> u32 {
        self.backoff
    }
}

/// Severity of a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    /// Normal teardown noise; must not count as an error.
    Benign,
    Transient,
    /// TLS/DNS/bad-response class; relay is unlikely to ever work.
    Fatal,
}

fn classify_ws_error(error: &WsError) -> ErrorClass {
    use std::io::ErrorKind;

    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ErrorClass::Benign,
        WsError::Io(io) => match io.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted => ErrorClass::Benign,
            _ => ErrorClass::Transient,
        },
        WsError::Tls(_) | WsError::Url(_) | WsError::Http(_) | WsError::HttpFormat(_) => {
            ErrorClass::Fatal
        }
        _ => ErrorClass::Transient,
    }
}

/// Penalty-box eligibility decision. Kept as three independent checks.
fn penalty_reason(
    kind: ConnectionKind,
    ever_connected: bool,
    errors: u64,
    class: ErrorClass,
    others_connected: bool,
) -> Option<PenaltyReason> {
    if !kind.penalty_eligible() || ever_connected {
        return None;
    }
    if class == ErrorClass::Fatal {
        return Some(PenaltyReason::FatalTransport);
    }
    if errors >= 3 {
        return Some(PenaltyReason::NeverConnected);
    }
    if errors >= 2 && others_connected {
        return Some(PenaltyReason::FailingWhileOthersConnected);
    }
    None
}

/// State observable from outside the connection task.
#[derive(Debug, Default)]
struct ConnShared {
    connected: AtomicBool,
    connecting: AtomicBool,
    authenticating: AtomicBool,
    ever_connected: AtomicBool,
    queue_len: AtomicUsize,
    last_received: Mutex<Option<Instant>>,
    subscriptions: Mutex<HashSet<String>>,
}

enum Command {
    Connect { force: bool },
    Disconnect,
    Send { frame: String, bypass: bool },
    Ping,
    AuthSigned(Box<Event>),
}

/// Handle to one relay connection. All mutation funnels through the
/// owned task; the handle itself is safe to share.
pub struct RelayConnection {
    url: CanonicalRelayUrl,
    kind: ConnectionKind,
    descriptor: Arc<RwLock<RelayDescriptor>>,
    shared: Arc<ConnShared>,
    stats: Arc<ConnectionStats>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    opened_at: Instant,
}

impl RelayConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        descriptor: RelayDescriptor,
        kind: ConnectionKind,
        signals: Arc<PoolSignals>,
        stats: Arc<ConnectionStats>,
        reachability: watch::Receiver<NetworkState>,
        notifications: broadcast::Sender<PoolNotification>,
        signer: Option<Arc<dyn Signer>>,
    ) -> Arc<Self> {
        let url = descriptor.url().to_string();
        let descriptor = Arc::new(RwLock::new(descriptor));
        let shared = Arc::new(ConnShared::default());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let task = ConnectionTask {
            url: url.clone(),
            kind,
            descriptor: Arc::clone(&descriptor),
            shared: Arc::clone(&shared),
            stats: Arc::clone(&stats),
            signals,
            reachability,
            notifications,
            signer,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            socket: None,
            out_queue: VecDeque::new(),
            gate: BackoffGate::default(),
            auth_challenge: None,
            auth_sent: false,
            last_auth_attempt: None,
            awaiting_pong: false,
        };
        tokio::spawn(task.run());

        Arc::new(Self {
            url,
            kind,
            descriptor,
            shared,
            stats,
            cmd_tx,
            opened_at: Instant::now(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn descriptor(&self) -> RelayDescriptor {
        self.descriptor.read().clone()
    }

    /// Mutate capability flags / exclusions in place. The URL identity is
    /// fixed; only flags and exclusions are updated.
    pub fn update_descriptor(&self, update: impl FnOnce(&mut RelayDescriptor)) {
        update(&mut self.descriptor.write());
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub fn is_connecting(&self) -> bool {
        self.shared.connecting.load(Ordering::Relaxed)
    }

    pub fn is_authenticating(&self) -> bool {
        self.shared.authenticating.load(Ordering::Relaxed)
    }

    pub fn ever_connected(&self) -> bool {
        self.shared.ever_connected.load(Ordering::Relaxed)
    }

    /// Frames waiting in the outbound queue.
    pub fn pending_messages(&self) -> usize {
        self.shared.queue_len.load(Ordering::Relaxed)
    }

    pub fn last_received(&self) -> Option<Instant> {
        *self.shared.last_received.lock()
    }

    /// Time since the last inbound message, or since the connection was
    /// created if nothing was ever received. Used by the eviction sweep.
    pub fn idle_duration(&self) -> Duration {
        self.last_received()
            .map(|at| at.elapsed())
            .unwrap_or_else(|| self.opened_at.elapsed())
    }

    pub fn has_subscription(&self, subscription_id: &str) -> bool {
        self.shared.subscriptions.lock().contains(subscription_id)
    }

    pub fn add_subscription(&self, subscription_id: String) {
        self.shared.subscriptions.lock().insert(subscription_id);
    }

    pub fn remove_subscription(&self, subscription_id: &str) -> bool {
        self.shared.subscriptions.lock().remove(subscription_id)
    }

    pub fn stats(&self) -> Arc<ConnectionStats> {
        Arc::clone(&self.stats)
    }

    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect { force: false });
    }

    /// Connect bypassing the backoff skip gate (used on network-recovery
    /// transitions and explicit user action).
    pub fn connect_forced(&self) {
        let _ = self.cmd_tx.send(Command::Connect { force: true });
    }

    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// Queue a frame for in-order delivery.
    pub fn send(&self, frame: String) {
        let _ = self.cmd_tx.send(Command::Send {
            frame,
            bypass: false,
        });
    }

    /// Send immediately if the socket is open, else queue-jump to the
    /// front. Used for auth responses.
    pub fn send_bypass(&self, frame: String) {
        let _ = self.cmd_tx.send(Command::Send {
            frame,
            bypass: true,
        });
    }

    pub fn ping(&self) {
        let _ = self.cmd_tx.send(Command::Ping);
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url)
            .field("kind", &self.kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct ConnectionTask {
    url: CanonicalRelayUrl,
    kind: ConnectionKind,
    descriptor: Arc<RwLock<RelayDescriptor>>,
    shared: Arc<ConnShared>,
    stats: Arc<ConnectionStats>,
    signals: Arc<PoolSignals>,
    reachability: watch::Receiver<NetworkState>,
    notifications: broadcast::Sender<PoolNotification>,
    signer: Option<Arc<dyn Signer>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    socket: Option<WsStream>,
    out_queue: VecDeque<String>,
    gate: BackoffGate,
    auth_challenge: Option<String>,
    auth_sent: bool,
    last_auth_attempt: Option<Instant>,
    awaiting_pong: bool,
}

async fn next_ws_message(
    socket: &mut Option<WsStream>,
) -> Option<Result<WsMessage, WsError>> {
    match socket {
        Some(ws) => ws.next().await,
        None => std::future::pending().await,
    }
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut reachability_open = true;
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // All handles dropped: the connection was evicted.
                    None => break,
                },
                changed = self.reachability.changed(), if reachability_open => {
                    if changed.is_err() {
                        reachability_open = false;
                    } else {
                        self.handle_network_transition().await;
                    }
                }
                // Pends forever while no socket is open; command/network
                // branches still wake the loop.
                incoming = next_ws_message(&mut self.socket) => {
                    self.handle_incoming(incoming).await;
                }
            }
        }
        self.drop_socket("evicted").await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { force } => self.connect(force).await,
            Command::Disconnect => {
                self.drop_socket("requested").await;
                self.gate = BackoffGate::default();
                self.shared.subscriptions.lock().clear();
                self.auth_challenge = None;
                self.auth_sent = false;
            }
            Command::Send { frame, bypass } => self.send(frame, bypass).await,
            Command::Ping => self.ping().await,
            Command::AuthSigned(event) => self.dispatch_auth(*event).await,
        }
    }

    async fn connect(&mut self, force: bool) {
        if self.shared.connected.load(Ordering::Relaxed)
            || self.shared.connecting.load(Ordering::Relaxed)
        {
            tracing::debug!(relay = %self.url, "already connected/connecting, skipping connect");
            return;
        }
        if !self.reachability.borrow().online {
            tracing::debug!(relay = %self.url, "no network, skipping connect");
            return;
        }
        if !self.gate.allow_attempt(force) {
            tracing::debug!(
                relay = %self.url,
                backoff = self.gate.backoff(),
                "skipping reconnect attempt"
            );
            return;
        }

        self.shared.connecting.store(true, Ordering::Relaxed);
        self.shared.subscriptions.lock().clear();
        self.auth_challenge = None;
        self.auth_sent = false;
        self.awaiting_pong = false;

        let attempt = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await;
        self.shared.connecting.store(false, Ordering::Relaxed);

        match attempt {
            Ok(Ok((socket, _response))) => {
                self.socket = Some(socket);
                self.shared.connected.store(true, Ordering::Relaxed);
                self.shared.ever_connected.store(true, Ordering::Relaxed);
                *self.shared.last_received.lock() = Some(Instant::now());
                self.gate.record_success();
                self.signals.connection_up();
                self.stats.record_connect();
                counter!("relay_connects_total").increment(1);
                tracing::info!(relay = %self.url, "connected");
                let _ = self.notifications.send(PoolNotification::Connected {
                    relay_url: self.url.clone(),
                });
                Box::pin(self.flush_queue()).await;
            }
            Ok(Err(error)) => {
                let class = classify_ws_error(&error);
                self.transport_error(error.to_string(), class).await;
            }
            Err(_elapsed) => {
                self.transport_error("connect timeout".to_string(), ErrorClass::Transient)
                    .await;
            }
        }
    }

    /// The normal queue only flushes once auth requirements are met; the
    /// bypass lane (auth responses) ignores the gate.
    fn queue_gate_open(&self) -> bool {
        !self.descriptor.read().auth || self.auth_sent
    }

    async fn send(&mut self, frame: String, bypass: bool) {
        if !self.reachability.borrow().online {
            tracing::debug!(relay = %self.url, "no network, dropping outbound frame");
            return;
        }

        if bypass {
            if self.socket.is_some() {
                if let Err(error) = self.send_frame(&frame).await {
                    self.out_queue.push_front(frame);
                    self.sync_queue_len();
                    let class = classify_ws_error(&error);
                    self.transport_error(error.to_string(), class).await;
                    self.connect(false).await;
                }
                return;
            }
            self.out_queue.push_front(frame);
        } else {
            self.out_queue.push_back(frame);
        }
        self.sync_queue_len();

        if self.socket.is_some() {
            self.flush_queue().await;
        }
    }

    async fn flush_queue(&mut self) {
        if self.socket.is_none() || !self.queue_gate_open() {
            if !self.out_queue.is_empty() && self.socket.is_some() {
                tracing::debug!(relay = %self.url, "withholding queue until authenticated");
            }
            return;
        }

        while let Some(frame) = self.out_queue.pop_front() {
            if let Err(error) = self.send_frame(&frame).await {
                // Requeue and reconnect; the frame goes out after recovery.
                self.out_queue.push_front(frame);
                self.sync_queue_len();
                let class = classify_ws_error(&error);
                self.transport_error(error.to_string(), class).await;
                self.connect(false).await;
                return;
            }
        }
        self.sync_queue_len();
    }

    async fn send_frame(&mut self, frame: &str) -> Result<(), WsError> {
        match self.socket.as_mut() {
            Some(socket) => {
                tracing::debug!(relay = %self.url, frame, "send");
                socket.send(WsMessage::Text(frame.to_string().into())).await
            }
            None => Err(WsError::ConnectionClosed),
        }
    }

    async fn ping(&mut self) {
        if self.socket.is_none() {
            tracing::debug!(relay = %self.url, "not connected, cannot ping");
            return;
        }
        if self.awaiting_pong {
            // The previous ping never came back; that is a dead socket.
            self.transport_error("pong timeout".to_string(), ErrorClass::Transient)
                .await;
            return;
        }
        if let Some(socket) = self.socket.as_mut() {
            match socket.send(WsMessage::Ping(Vec::new().into())).await {
                Ok(()) => self.awaiting_pong = true,
                Err(error) => {
                    let class = classify_ws_error(&error);
                    self.transport_error(error.to_string(), class).await;
                }
            }
        }
    }

    async fn handle_incoming(&mut self, incoming: Option<Result<WsMessage, WsError>>) {
        match incoming {
            None => {
                // Clean close from the relay side.
                tracing::info!(relay = %self.url, "disconnected");
                self.drop_socket("closed").await;
                self.gate.record_success();
                self.shared.subscriptions.lock().clear();
            }
            Some(Ok(WsMessage::Text(text))) => self.handle_text(text.as_str()).await,
            Some(Ok(WsMessage::Pong(_))) => {
                self.awaiting_pong = false;
                self.mark_received();
            }
            Some(Ok(WsMessage::Binary(_))) => self.mark_received(),
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                let class = classify_ws_error(&error);
                self.transport_error(error.to_string(), class).await;
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        self.mark_received();
        self.stats.record_message();

        let message = match RelayMessage::parse(text) {
            Ok(message) => message,
            Err(error) => {
                // Bad frame, not a bad connection.
                tracing::debug!(relay = %self.url, %error, "skipping unparseable frame");
                return;
            }
        };

        match &message {
            RelayMessage::Auth { challenge } => {
                self.handle_auth_challenge(challenge.clone());
            }
            RelayMessage::Notice { message } => {
                tracing::debug!(relay = %self.url, notice = %message, "relay notice");
                self.stats.record_notice(message.clone());
            }
            RelayMessage::Event { event, .. } => {
                self.stats.record_pubkey(event.pubkey);
            }
            RelayMessage::Closed {
                subscription_id, ..
            } => {
                self.shared.subscriptions.lock().remove(subscription_id);
            }
            _ => {}
        }

        let _ = self.notifications.send(PoolNotification::Message {
            relay_url: self.url.clone(),
            message,
        });
    }

    /// Store the challenge and kick off signing, throttled so a relay
    /// spraying challenges gets at most one response per window. Signing
    /// may be slow (remote signer), so it runs off this task and the
    /// signed event comes back as a command.
    fn handle_auth_challenge(&mut self, challenge: String) {
        self.auth_challenge = Some(challenge.clone());
        self.shared.authenticating.store(true, Ordering::Relaxed);

        if let Some(last) = self.last_auth_attempt
            && last.elapsed() < AUTH_THROTTLE
        {
            tracing::debug!(relay = %self.url, "auth challenge throttled");
            return;
        }
        let Some(signer) = self.signer.clone() else {
            tracing::warn!(relay = %self.url, "auth challenge received but no signer configured");
            return;
        };
        self.last_auth_attempt = Some(Instant::now());

        let url = self.url.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let relay_url = match RelayUrl::parse(&url) {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::warn!(relay = %url, %error, "cannot build auth event");
                    return;
                }
            };
            let unsigned = EventBuilder::auth(challenge, relay_url).build(signer.public_key());
            match signer.sign_event(unsigned).await {
                Ok(event) => {
                    let _ = cmd_tx.send(Command::AuthSigned(Box::new(event)));
                }
                Err(error) => {
                    tracing::warn!(relay = %url, %error, "failed to sign auth response");
                }
            }
        });
    }

    /// Route the signed auth response through the bypass lane, then open
    /// the normal queue: one dispatched response authenticates the
    /// session.
    async fn dispatch_auth(&mut self, event: Event) {
        let frame = ClientMessage::auth(event).to_json();
        self.auth_sent = true;
        self.shared.authenticating.store(false, Ordering::Relaxed);
        counter!("relay_auth_responses_total").increment(1);
        tracing::info!(relay = %self.url, "sending auth response");
        self.send(frame, true).await;
        self.flush_queue().await;
    }

    fn mark_received(&mut self) {
        *self.shared.last_received.lock() = Some(Instant::now());
        self.gate.record_success();
    }

    async fn handle_network_transition(&mut self) {
        let state = *self.reachability.borrow_and_update();
        if !state.online {
            tracing::debug!(relay = %self.url, "device offline");
            self.drop_socket("offline").await;
            self.shared.subscriptions.lock().clear();
        } else if self.descriptor.read().should_connect()
            && !self.shared.connected.load(Ordering::Relaxed)
        {
            self.connect(true).await;
        }
    }

    /// Tear the socket down without touching the backoff gate.
    async fn drop_socket(&mut self, reason: &'static str) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
        self.shared.connecting.store(false, Ordering::Relaxed);
        self.shared.authenticating.store(false, Ordering::Relaxed);
        self.awaiting_pong = false;
        if self.shared.connected.swap(false, Ordering::Relaxed) {
            self.signals.connection_down();
            counter!("relay_disconnects_total", "reason" => reason).increment(1);
            let _ = self.notifications.send(PoolNotification::Disconnected {
                relay_url: self.url.clone(),
            });
        }
    }

    async fn transport_error(&mut self, message: String, class: ErrorClass) {
        self.drop_socket("error").await;
        self.shared.subscriptions.lock().clear();

        let others_connected = self.signals.any_connected();
        self.gate.record_failure(others_connected);

        if class != ErrorClass::Benign {
            self.stats.record_error(message.clone());
            counter!("relay_errors_total").increment(1);

            if let Some(reason) = penalty_reason(
                self.kind,
                self.shared.ever_connected.load(Ordering::Relaxed),
                self.stats.errors(),
                class,
                others_connected,
            ) {
                self.signals.report_penalty(self.url.clone(), reason);
            }
        }
        tracing::info!(relay = %self.url, error = %message, "disconnected with error");
    }

    fn sync_queue_len(&self) {
        self.shared
            .queue_len
            .store(self.out_queue.len(), Ordering::Relaxed);
    }
}
