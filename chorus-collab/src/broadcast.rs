//! Per-document fan-out of encoded server messages.
//!
//! Every document gets one tokio broadcast channel; each connection's write
//! loop holds a receiver. Frames carry the originating connection ID so
//! receivers drop their own echoes without decoding the payload. Messages
//! are encoded once by the sender and shared as `Arc<Vec<u8>>` across all
//! receivers.
//!
//! Who is *in* a document is the presence tracker's business — this module
//! only moves bytes. A lagging receiver drops messages (bounded buffer)
//! rather than ever blocking the submit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// An encoded server message plus its origin connection.
///
/// `origin` is `Uuid::nil()` for server-originated frames that every
/// receiver should deliver.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: Uuid,
    pub payload: Arc<Vec<u8>>,
}

/// Fan-out statistics for one document channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub subscribers: usize,
}

/// Broadcast channel for a single document.
pub struct DocumentChannel {
    sender: broadcast::Sender<Frame>,
    capacity: usize,
    frames_sent: AtomicU64,
}

impl DocumentChannel {
    /// Create a channel buffering up to `capacity` frames per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Subscribe a connection's write loop.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    /// Send an encoded frame to all subscribers. Lock-free; returns the
    /// number of receivers the frame reached (0 when nobody listens).
    pub fn send(&self, origin: Uuid, payload: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(Frame { origin, payload }).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Live receiver count.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Snapshot of channel statistics.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    /// Buffered frames per receiver before drops.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Registry mapping document IDs to their broadcast channels.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<Uuid, Arc<DocumentChannel>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the channel for a document.
    pub async fn get_or_create(&self, document_id: Uuid) -> Arc<DocumentChannel> {
        // Fast path: read lock
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&document_id) {
                return channel.clone();
            }
        }

        // Slow path: write lock, double-check after acquiring
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(&document_id) {
            return channel.clone();
        }

        let channel = Arc::new(DocumentChannel::new(self.default_capacity));
        channels.insert(document_id, channel.clone());
        channel
    }

    /// The channel for a document, if one exists.
    pub async fn get(&self, document_id: Uuid) -> Option<Arc<DocumentChannel>> {
        self.channels.read().await.get(&document_id).cloned()
    }

    /// Drop a channel nobody subscribes to. Returns `true` when removed.
    pub async fn remove_if_idle(&self, document_id: Uuid) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(&document_id) {
            if channel.subscriber_count() == 0 {
                channels.remove(&document_id);
                return true;
            }
        }
        false
    }

    /// Number of live channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
