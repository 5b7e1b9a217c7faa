//! WebSocket synchronization server for collaborative documents.
//!
//! ```text
//! Client A ──┐                         ┌── AccessControl (external)
//!             ├── SyncServer ── CollabCore ── ContentStore (external)
//! Client B ──┘        │            │
//!                     │            ├── LockManager ── LeaseStore
//!                     │            ├── OperationLog (RocksDB)
//!                     │            ├── PresenceTracker
//!                     │            └── ChannelRegistry (fan-out)
//!                     └── Sweeper (background)
//! ```
//!
//! Per-connection lifecycle: Disconnected → Connected → Joined(document)
//! → Disconnected. Document messages sent outside `Joined` are answered
//! with a coded error, never silently dropped.
//!
//! The submit pipeline serializes per document across all server
//! processes: acquire the document lock, re-read the authoritative
//! version, rebase if stale, append-and-advance atomically, release,
//! broadcast. Presence signals bypass the lock entirely.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{ChannelRegistry, Frame};
use crate::config::CollabConfig;
use crate::external::{apply_operation, AccessControl, ContentError, ContentStore};
use crate::lock::{document_resource_key, LeaseStore, LockError, LockManager, MemoryLeaseStore};
use crate::presence::PresenceTracker;
use crate::protocol::{
    ClientMessage, CommittedOp, CursorPositionDto, ErrorCode, ParticipantDto, ServerMessage,
    SubmitDto,
};
use crate::storage::{OperationLog, StoreConfig, StoreError};
use crate::sweeper::Sweeper;
use crate::transform::{transform, Operation};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Operation log storage path
    pub storage_path: PathBuf,
    /// Timing and capacity knobs
    pub collab: CollabConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9470".to_string(),
            storage_path: PathBuf::from("chorus_data"),
            collab: CollabConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub operations_committed: u64,
    pub operations_rebased: u64,
    pub lock_timeouts: u64,
    pub active_documents: usize,
}

/// Shared handler state: every component the protocol touches.
struct CollabCore {
    config: CollabConfig,
    oplog: Arc<OperationLog>,
    locks: LockManager,
    tracker: Arc<PresenceTracker>,
    channels: ChannelRegistry,
    access: Arc<dyn AccessControl>,
    content: Arc<dyn ContentStore>,
    stats: RwLock<ServerStats>,
}

impl CollabCore {
    fn new(
        config: CollabConfig,
        oplog: Arc<OperationLog>,
        lease_store: Arc<dyn LeaseStore>,
        access: Arc<dyn AccessControl>,
        content: Arc<dyn ContentStore>,
    ) -> Arc<Self> {
        let locks = LockManager::new(lease_store, &config);
        let channels = ChannelRegistry::new(config.broadcast_capacity);
        Arc::new(Self {
            config,
            oplog,
            locks,
            tracker: Arc::new(PresenceTracker::new()),
            channels,
            access,
            content,
            stats: RwLock::new(ServerStats::default()),
        })
    }

    // ─── Join / Leave ─────────────────────────────────────────────────

    /// Authorize, snapshot, register and announce a joining connection.
    ///
    /// On success returns the join reply plus the connection's broadcast
    /// receiver. On failure the connection remains un-joined and the error
    /// reply carries the failure category.
    async fn join(
        &self,
        connection_id: Uuid,
        document_id: Uuid,
        user_id: Uuid,
        display_name: String,
    ) -> Result<(ServerMessage, broadcast::Receiver<Frame>), ServerMessage> {
        if !self.access.is_authorized(document_id, user_id).await {
            return Err(ServerMessage::error(
                ErrorCode::PermissionDenied,
                "not authorized for this document",
            ));
        }

        let snapshot = match self.content.snapshot(document_id).await {
            Ok(snapshot) => snapshot,
            Err(ContentError::NotFound(_)) => {
                return Err(ServerMessage::error(
                    ErrorCode::NotFound,
                    "document does not exist",
                ));
            }
            Err(e) => {
                log::error!("Snapshot for join of {document_id} failed: {e}");
                return Err(ServerMessage::error(
                    ErrorCode::Storage,
                    "could not load document",
                ));
            }
        };

        // Subscribe before registering so no frame between the two is lost.
        let channel = self.channels.get_or_create(document_id).await;
        let receiver = channel.subscribe();

        let entry = self
            .tracker
            .track(connection_id, document_id, user_id, display_name)
            .await;

        self.broadcast_to_document(
            document_id,
            connection_id,
            &ServerMessage::UserJoined(ParticipantDto::from_entry(&entry)),
        )
        .await;

        let participants = self
            .tracker
            .participants(document_id)
            .await
            .iter()
            .map(ParticipantDto::from_entry)
            .collect();

        Ok((
            ServerMessage::JoinReply {
                content: snapshot.content,
                version: snapshot.version,
                participants,
            },
            receiver,
        ))
    }

    /// Unregister a connection and announce the departure.
    ///
    /// Every failure here is logged and swallowed — from the client's
    /// perspective a disconnect never fails.
    async fn disconnect(&self, connection_id: Uuid) {
        let Some(entry) = self.tracker.remove(connection_id).await else {
            return;
        };

        self.broadcast_to_document(
            entry.document_id,
            connection_id,
            &ServerMessage::UserLeft {
                user_id: entry.user_id,
            },
        )
        .await;

        if self.channels.remove_if_idle(entry.document_id).await {
            log::debug!("Document {} channel closed (no subscribers)", entry.document_id);
        }
    }

    // ─── Submit ───────────────────────────────────────────────────────

    /// Validate, lock, rebase, append, broadcast. Returns the reply for
    /// the submitter; the committed operation is broadcast to everyone
    /// else on the document before this returns.
    async fn submit(
        &self,
        connection_id: Uuid,
        document_id: Uuid,
        user_id: Uuid,
        dto: SubmitDto,
    ) -> ServerMessage {
        let op = match dto.into_operation(document_id, user_id) {
            Ok(op) => op,
            Err(e) => return ServerMessage::error(ErrorCode::Validation, e.to_string()),
        };

        let key = document_resource_key(document_id);
        let handle = match self
            .locks
            .acquire(&key, self.config.lock_acquire_timeout)
            .await
        {
            Ok(handle) => handle,
            Err(LockError::Timeout { .. }) => {
                self.stats.write().await.lock_timeouts += 1;
                return ServerMessage::error(ErrorCode::LockTimeout, "document busy, retry");
            }
            Err(LockError::Cancelled { .. }) => {
                return ServerMessage::error(ErrorCode::Cancelled, "submission cancelled");
            }
        };

        // The critical section runs to completion once the lock is held;
        // release happens on every outcome.
        let outcome = self.commit_locked(op).await;
        self.locks.release(handle).await;

        match outcome {
            Ok(committed) => {
                self.stats.write().await.operations_committed += 1;
                let reply = ServerMessage::Committed(CommittedOp::from_operation(&committed));
                self.broadcast_to_document(document_id, connection_id, &reply).await;
                reply
            }
            Err(reply) => reply,
        }
    }

    /// The locked critical section: read latest version, rebase if stale,
    /// append-and-advance.
    ///
    /// A version conflict from the log means another process advanced the
    /// document between our read and our append (possible when the lease
    /// store is shared more loosely than the log); re-read and rebase
    /// again rather than failing the submission.
    async fn commit_locked(&self, mut op: Operation) -> Result<Operation, ServerMessage> {
        loop {
            let latest = self.oplog.latest_version(op.document_id).map_err(|e| {
                log::error!("Version read for {} failed: {e}", op.document_id);
                ServerMessage::error(ErrorCode::Storage, "could not read document version")
            })?;

            if op.base_version > latest {
                return Err(ServerMessage::error(
                    ErrorCode::Validation,
                    "operation base version is ahead of the document",
                ));
            }

            if op.base_version < latest {
                let missing = self
                    .oplog
                    .operations_since(op.document_id, op.base_version)
                    .map_err(|e| {
                        log::error!("Rebase read for {} failed: {e}", op.document_id);
                        ServerMessage::error(ErrorCode::Storage, "could not read missed operations")
                    })?;
                for server_op in &missing {
                    op = transform(&op, server_op);
                }
                self.stats.write().await.operations_rebased += 1;
            }

            match self.oplog.append_committed(&op) {
                Ok(new_version) => {
                    // Content mutation follows the committed log entry. A
                    // failure here leaves the authoritative log intact; the
                    // content store reconciles from the log out of band.
                    if let Err(e) = apply_operation(self.content.as_ref(), &op, new_version).await
                    {
                        log::error!(
                            "Content mutation for {} at version {new_version} failed: {e}",
                            op.document_id
                        );
                    }
                    return Ok(op);
                }
                Err(StoreError::VersionConflict { expected, actual, .. }) => {
                    log::debug!(
                        "Append conflict on {} (authority {expected}, ours {actual}), rebasing again",
                        op.document_id
                    );
                    continue;
                }
                Err(e) => {
                    log::error!("Append for {} failed: {e}", op.document_id);
                    return Err(ServerMessage::error(
                        ErrorCode::Storage,
                        "could not persist operation, safe to retry",
                    ));
                }
            }
        }
    }

    // ─── Catch-up ─────────────────────────────────────────────────────

    /// Catch a lagging client up: incremental replay when the gap is
    /// small, full snapshot when it is empty or too large to stream.
    async fn sync_request(&self, document_id: Uuid, client_version: u64) -> ServerMessage {
        let pending = match self.oplog.operations_since(document_id, client_version) {
            Ok(pending) => pending,
            Err(e) => {
                log::error!("Catch-up read for {document_id} failed: {e}");
                return ServerMessage::error(ErrorCode::Storage, "could not read operations");
            }
        };

        if pending.is_empty() || pending.len() > self.config.catch_up_threshold {
            match self.content.snapshot(document_id).await {
                Ok(snapshot) => ServerMessage::SyncSnapshot {
                    content: snapshot.content,
                    version: snapshot.version,
                },
                Err(ContentError::NotFound(_)) => {
                    ServerMessage::error(ErrorCode::NotFound, "document does not exist")
                }
                Err(e) => {
                    log::error!("Catch-up snapshot for {document_id} failed: {e}");
                    ServerMessage::error(ErrorCode::Storage, "could not load document")
                }
            }
        } else {
            ServerMessage::SyncOperations {
                operations: pending.iter().map(CommittedOp::from_operation).collect(),
            }
        }
    }

    // ─── Presence signals ─────────────────────────────────────────────

    /// Relay a cursor move to the other document participants.
    /// Best-effort: never touches the lock, failures are logged only.
    async fn cursor(
        &self,
        connection_id: Uuid,
        document_id: Uuid,
        user_id: Uuid,
        cursor: CursorPositionDto,
    ) {
        self.broadcast_to_document(
            document_id,
            connection_id,
            &ServerMessage::CursorChanged { user_id, cursor },
        )
        .await;
    }

    /// Record and relay a typing-state change. Best-effort.
    async fn typing(
        &self,
        connection_id: Uuid,
        document_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    ) {
        if !self.tracker.set_typing(connection_id, is_typing).await {
            log::debug!("Typing signal from unregistered connection {connection_id}");
        }
        self.broadcast_to_document(
            document_id,
            connection_id,
            &ServerMessage::UserTyping { user_id, is_typing },
        )
        .await;
    }

    // ─── Fan-out ──────────────────────────────────────────────────────

    /// Encode once and fan out to every subscriber on the document.
    /// Receivers matching `origin` drop the frame (no echo to sender).
    async fn broadcast_to_document(&self, document_id: Uuid, origin: Uuid, msg: &ServerMessage) {
        let Some(channel) = self.channels.get(document_id).await else {
            return;
        };
        match msg.encode() {
            Ok(bytes) => {
                channel.send(origin, Arc::new(bytes));
            }
            Err(e) => {
                log::warn!("Failed to encode broadcast for {document_id}: {e}");
            }
        }
    }
}

/// The collaboration sync server.
pub struct SyncServer {
    config: ServerConfig,
    core: Arc<CollabCore>,
    shutdown: CancellationToken,
}

impl SyncServer {
    /// Create a server with an in-process lease store (single-process
    /// deployments). Opens the operation log at the configured path.
    pub fn new(
        config: ServerConfig,
        access: Arc<dyn AccessControl>,
        content: Arc<dyn ContentStore>,
    ) -> Result<Self, StoreError> {
        Self::with_lease_store(config, access, content, Arc::new(MemoryLeaseStore::new()))
    }

    /// Create a server with an explicit lease store — the seam for
    /// multi-process deployments sharing lock state.
    pub fn with_lease_store(
        config: ServerConfig,
        access: Arc<dyn AccessControl>,
        content: Arc<dyn ContentStore>,
        lease_store: Arc<dyn LeaseStore>,
    ) -> Result<Self, StoreError> {
        let oplog = Arc::new(OperationLog::open(StoreConfig {
            path: config.storage_path.clone(),
            ..StoreConfig::default()
        })?);
        let core = CollabCore::new(config.collab.clone(), oplog, lease_store, access, content);
        Ok(Self {
            config,
            core,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start accepting WebSocket connections and run until shutdown.
    ///
    /// Spawns the cleanup sweeper alongside the accept loop.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        let sweeper = Sweeper::new(
            self.core.oplog.clone(),
            self.core.tracker.clone(),
            &self.config.collab,
        );
        tokio::spawn(sweeper.run(self.shutdown.child_token()));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    log::info!("Sync server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let core = self.core.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(core, stream, addr).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }

    /// Signal the accept loop and sweeper to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.core.stats.read().await.clone();
        stats.active_documents = self.core.tracker.active_documents().await.len();
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// The presence tracker (diagnostics).
    pub fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.core.tracker
    }

    /// The operation log (diagnostics, tooling).
    pub fn operation_log(&self) -> &Arc<OperationLog> {
        &self.core.oplog
    }

    /// Whether a document's lock is currently held. Diagnostic only.
    pub async fn is_document_locked(&self, document_id: Uuid) -> bool {
        self.core
            .locks
            .is_locked(&document_resource_key(document_id))
            .await
    }
}

/// Handle a single WebSocket connection through its whole lifecycle.
async fn handle_connection(
    core: Arc<CollabCore>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id = Uuid::new_v4();
    log::info!("Connection {connection_id} established from {addr}");

    {
        let mut stats = core.stats.write().await;
        stats.total_connections += 1;
        stats.active_connections += 1;
    }

    // Connection-local session state: None until a successful Join.
    let mut session: Option<(Uuid, Uuid)> = None; // (document_id, user_id)
    let mut broadcast_rx: Option<broadcast::Receiver<Frame>> = None;

    loop {
        tokio::select! {
            // Inbound WebSocket frame
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut stats = core.stats.write().await;
                            stats.total_messages += 1;
                            stats.total_bytes += bytes.len() as u64;
                        }

                        let client_msg = match ClientMessage::decode(&bytes) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::warn!("Undecodable frame from {connection_id}: {e}");
                                let reply = ServerMessage::error(
                                    ErrorCode::Protocol,
                                    "could not decode message",
                                );
                                if send_message(&mut ws_sender, &reply).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        match client_msg {
                            ClientMessage::Join { document_id, user_id, display_name } => {
                                if session.is_some() {
                                    let reply = ServerMessage::error(
                                        ErrorCode::Protocol,
                                        "already joined to a document",
                                    );
                                    if send_message(&mut ws_sender, &reply).await.is_err() {
                                        break;
                                    }
                                    continue;
                                }

                                match core.join(connection_id, document_id, user_id, display_name).await {
                                    Ok((reply, receiver)) => {
                                        session = Some((document_id, user_id));
                                        broadcast_rx = Some(receiver);
                                        log::info!(
                                            "Connection {connection_id} joined document {document_id} as user {user_id}"
                                        );
                                        if send_message(&mut ws_sender, &reply).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(reply) => {
                                        if send_message(&mut ws_sender, &reply).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }

                            ClientMessage::Leave => {
                                // Clean exit; unregistration happens in the
                                // shared cleanup path below.
                                log::info!("Connection {connection_id} left");
                                break;
                            }

                            ClientMessage::Submit(dto) => {
                                let reply = match session {
                                    Some((document_id, user_id)) => {
                                        core.submit(connection_id, document_id, user_id, dto).await
                                    }
                                    None => ServerMessage::error(
                                        ErrorCode::NotJoined,
                                        "join a document before submitting",
                                    ),
                                };
                                if send_message(&mut ws_sender, &reply).await.is_err() {
                                    break;
                                }
                            }

                            ClientMessage::SyncRequest { client_version } => {
                                let reply = match session {
                                    Some((document_id, _)) => {
                                        core.sync_request(document_id, client_version).await
                                    }
                                    None => ServerMessage::error(
                                        ErrorCode::NotJoined,
                                        "join a document before syncing",
                                    ),
                                };
                                if send_message(&mut ws_sender, &reply).await.is_err() {
                                    break;
                                }
                            }

                            ClientMessage::Cursor(cursor) => {
                                if let Some((document_id, user_id)) = session {
                                    core.cursor(connection_id, document_id, user_id, cursor).await;
                                }
                            }

                            ClientMessage::Typing { is_typing } => {
                                if let Some((document_id, user_id)) = session {
                                    core.typing(connection_id, document_id, user_id, is_typing).await;
                                }
                            }

                            ClientMessage::Ping => {
                                if send_message(&mut ws_sender, &ServerMessage::Pong).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {connection_id} closed");
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }

                    Some(Err(e)) => {
                        log::error!("WebSocket error on {connection_id}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Outbound broadcast frame
            frame = async {
                match broadcast_rx {
                    Some(ref mut rx) => rx.recv().await,
                    // Not joined yet — wait forever on this branch.
                    None => std::future::pending().await,
                }
            } => {
                match frame {
                    Ok(frame) => {
                        if frame.origin == connection_id {
                            continue; // Never echo a connection's own frames
                        }
                        if ws_sender
                            .send(Message::Binary(frame.payload.to_vec().into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {connection_id} lagged by {n} broadcast frames");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    // Cleanup runs on every exit path out of the loop. Drop the receiver
    // first so an empty document's channel can be reclaimed.
    drop(broadcast_rx.take());
    core.disconnect(connection_id).await;

    let mut stats = core.stats.write().await;
    stats.active_connections -= 1;

    Ok(())
}

/// Encode and send one server message; failures are logged and returned
/// so the caller can drop the connection.
async fn send_message(sender: &mut WsSink, msg: &ServerMessage) -> Result<(), ()> {
    let encoded = msg.encode().map_err(|e| {
        log::error!("Failed to encode server message: {e}");
    })?;
    sender
        .send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| {
            log::debug!("Failed to send server message: {e}");
        })
}
