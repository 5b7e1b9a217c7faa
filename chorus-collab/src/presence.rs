//! Connection and presence tracking for document sessions.
//!
//! Three indexes describe who is connected where:
//!
//! ```text
//! connection_id ──► document_id          (routing submits & signals)
//! document_id   ──► {connection_id, …}   (broadcast targets, sweeping)
//! connection_id ──► ConnectionEntry      (presence metadata)
//! ```
//!
//! All three live under one `RwLock` and mutate in a single write section,
//! so a connection can never appear in one index but not another — the race
//! that otherwise shows up between a presence update and disconnect
//! cleanup. Presence state is ephemeral: entries are created on join,
//! destroyed on leave, and never persisted across reconnects (the color and
//! typing flag are regenerated).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::SystemTime;
use tokio::sync::RwLock;
use uuid::Uuid;

/// RGBA color assigned to a collaborator's cursor and selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresenceColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl PresenceColor {
    /// Generate a stable, visually distinct color from a user UUID.
    ///
    /// Uses HSL with high saturation; the hue comes from the UUID hash so
    /// the same user gets the same color on every replica.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// Convert to [f32; 4] array for rendering.
    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// HSL to RGB conversion helper.
fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Presence metadata for one connection in one document session.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEntry {
    pub connection_id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub color: PresenceColor,
    /// Milliseconds since epoch.
    pub joined_at: u64,
    /// Ephemeral typing flag, flipped by presence signals.
    pub is_typing: bool,
}

/// Indexes guarded together — see module docs.
#[derive(Default)]
struct Indexes {
    connection_document: HashMap<Uuid, Uuid>,
    document_connections: HashMap<Uuid, HashSet<Uuid>>,
    entries: HashMap<Uuid, ConnectionEntry>,
}

/// Bidirectional connection/document/presence index.
pub struct PresenceTracker {
    inner: RwLock<Indexes>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Register a connection in a document session.
    ///
    /// All three indexes update under one write lock. Returns the created
    /// entry (with the server-assigned color) for the join reply.
    pub async fn track(
        &self,
        connection_id: Uuid,
        document_id: Uuid,
        user_id: Uuid,
        display_name: impl Into<String>,
    ) -> ConnectionEntry {
        let entry = ConnectionEntry {
            connection_id,
            document_id,
            user_id,
            display_name: display_name.into(),
            color: PresenceColor::from_uuid(user_id),
            joined_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            is_typing: false,
        };

        let mut inner = self.inner.write().await;
        inner.connection_document.insert(connection_id, document_id);
        inner
            .document_connections
            .entry(document_id)
            .or_default()
            .insert(connection_id);
        inner.entries.insert(connection_id, entry.clone());
        entry
    }

    /// Remove a connection from all three indexes.
    ///
    /// When the connection's document has no remaining connections, the
    /// document leaves the active set. Returns the removed entry so the
    /// caller can broadcast the departure.
    pub async fn remove(&self, connection_id: Uuid) -> Option<ConnectionEntry> {
        let mut inner = self.inner.write().await;
        let document_id = inner.connection_document.remove(&connection_id)?;

        if let Some(connections) = inner.document_connections.get_mut(&document_id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                inner.document_connections.remove(&document_id);
            }
        }

        inner.entries.remove(&connection_id)
    }

    /// Connection IDs currently joined to a document.
    pub async fn connections_for_document(&self, document_id: Uuid) -> Vec<Uuid> {
        let inner = self.inner.read().await;
        inner
            .document_connections
            .get(&document_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Presence metadata for a connection.
    pub async fn user_info(&self, connection_id: Uuid) -> Option<ConnectionEntry> {
        let inner = self.inner.read().await;
        inner.entries.get(&connection_id).cloned()
    }

    /// Documents with at least one live connection.
    pub async fn active_documents(&self) -> Vec<Uuid> {
        let inner = self.inner.read().await;
        inner.document_connections.keys().copied().collect()
    }

    /// Whether any connection is joined to the document.
    pub async fn has_document(&self, document_id: Uuid) -> bool {
        let inner = self.inner.read().await;
        inner.document_connections.contains_key(&document_id)
    }

    /// Full presence list for a document, for join replies.
    pub async fn participants(&self, document_id: Uuid) -> Vec<ConnectionEntry> {
        let inner = self.inner.read().await;
        let Some(connections) = inner.document_connections.get(&document_id) else {
            return Vec::new();
        };
        connections
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .cloned()
            .collect()
    }

    /// Flip a connection's ephemeral typing flag. Returns `false` for an
    /// unknown connection (already disconnected — callers treat this as a
    /// stale signal, not an error).
    pub async fn set_typing(&self, connection_id: Uuid, is_typing: bool) -> bool {
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(&connection_id) {
            Some(entry) => {
                entry.is_typing = is_typing;
                true
            }
            None => false,
        }
    }

    /// Total live connections across all documents.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.entries.len()
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
