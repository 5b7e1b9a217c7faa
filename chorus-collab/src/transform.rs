//! Operational-transformation engine for concurrent text edits.
//!
//! The transform rebases one client operation against one committed server
//! operation so that both edits can be applied in server order on every
//! replica and still preserve each author's intention:
//!
//! ```text
//!          doc @ v                      doc @ v
//!            │                            │
//!      O_server (committed)          O_client (stale)
//!            │                            │
//!            ▼                            ▼
//!          doc @ v+1   ◄── transform(O_client, O_server)
//! ```
//!
//! The walk consumes both component lists with two cursors, taking the
//! minimum overlapping length at each step. Concurrent inserts at the same
//! position are ordered server-first, client-second — arbitrary, but every
//! replica applies the same rule so all replicas converge.
//!
//! Pure computation: no I/O, no shared state, no allocation beyond the
//! output vector.
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// A single edit component, addressed in characters.
///
/// Closed sum type: every consumption site matches exhaustively so a new
/// variant cannot silently fall through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationComponent {
    /// Skip `n` characters of the document unchanged.
    Retain(u64),
    /// Insert the given text at the current position (empty text is legal).
    Insert(String),
    /// Delete `n` characters at the current position.
    Delete(u64),
}

impl OperationComponent {
    /// Character length of an insert payload.
    pub fn text_len(text: &str) -> u64 {
        text.chars().count() as u64
    }

    /// True for `Retain(0)`, `Delete(0)` and `Insert("")`.
    pub fn is_empty(&self) -> bool {
        match self {
            OperationComponent::Retain(n) => *n == 0,
            OperationComponent::Insert(text) => text.is_empty(),
            OperationComponent::Delete(n) => *n == 0,
        }
    }
}

/// An edit operation against a specific document version.
///
/// Immutable once committed: the log stores the operation exactly as
/// appended, keyed by `(document_id, base_version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Client-assigned operation ID (stable across rebases).
    pub id: Uuid,
    /// Document this operation edits.
    pub document_id: Uuid,
    /// Author.
    pub user_id: Uuid,
    /// Document version the operation was composed against.
    pub base_version: u64,
    /// Milliseconds since epoch, stamped when the server first sees the op.
    pub timestamp: u64,
    /// Ordered edit components.
    pub components: Vec<OperationComponent>,
}

impl Operation {
    /// Create a new operation stamped with the current wall clock.
    pub fn new(
        id: Uuid,
        document_id: Uuid,
        user_id: Uuid,
        base_version: u64,
        components: Vec<OperationComponent>,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            id,
            document_id,
            user_id,
            base_version,
            timestamp,
            components,
        }
    }
}

/// Rebase `client` against a committed `server` operation.
///
/// The result assumes the document state *after* `server` was applied:
/// `base_version` advances to `server.base_version + 1` and the components
/// are rewritten by [`transform_components`]. Identity fields and the
/// timestamp are preserved — a rebase changes where an edit lands, not who
/// made it or when.
pub fn transform(client: &Operation, server: &Operation) -> Operation {
    Operation {
        id: client.id,
        document_id: client.document_id,
        user_id: client.user_id,
        base_version: server.base_version + 1,
        timestamp: client.timestamp,
        components: transform_components(&client.components, &server.components),
    }
}

/// Rewrite `client` components to apply after `server` components.
///
/// Walks both lists with two cursors, consuming the minimum overlapping
/// length at each step. A partially consumed component is replaced in-place
/// by its remainder for the next iteration.
///
/// Exhaustion is asymmetric: once the client list is exhausted iteration
/// stops — the server's remaining components were already reflected in the
/// document when the server operation committed. Once the server list is
/// exhausted, remaining client components are appended verbatim.
pub fn transform_components(
    client: &[OperationComponent],
    server: &[OperationComponent],
) -> Vec<OperationComponent> {
    use OperationComponent::{Delete, Insert, Retain};

    let mut result = Vec::with_capacity(client.len() + server.len());

    // Cursor state: head component remainders, advanced as they are consumed.
    let mut client_iter = client.iter().cloned();
    let mut server_iter = server.iter().cloned();
    let mut client_head = client_iter.next();
    let mut server_head = server_iter.next();

    loop {
        let c = match client_head.take() {
            Some(c) => c,
            // Client exhausted: stop. The server's own tail is not re-emitted.
            None => break,
        };

        let s = match server_head.take() {
            Some(s) => s,
            None => {
                // Server exhausted: pass the rest of the client through verbatim.
                result.push(c);
                result.extend(client_iter.by_ref());
                break;
            }
        };

        // Zero-length components carry no positional weight. Client zeros
        // pass through to the output; server zeros are skipped. Consuming
        // them up-front keeps the min-length arithmetic from stalling.
        if matches!(c, Retain(0) | Delete(0)) {
            result.push(c);
            client_head = client_iter.next();
            server_head = Some(s);
            continue;
        }
        if matches!(s, Retain(0) | Delete(0)) || matches!(&s, Insert(t) if t.is_empty()) {
            client_head = Some(c);
            server_head = server_iter.next();
            continue;
        }

        match (c, s) {
            (Retain(m), Retain(n)) => {
                let k = m.min(n);
                result.push(Retain(k));
                client_head = remainder_count(Retain(m), k).or_else(|| client_iter.next());
                server_head = remainder_count(Retain(n), k).or_else(|| server_iter.next());
            }

            (c @ Retain(_), Insert(text)) => {
                // The server inserted text the client has not seen: skip it.
                result.push(Retain(OperationComponent::text_len(&text)));
                client_head = Some(c);
                server_head = server_iter.next();
            }

            (Retain(m), Delete(n)) => {
                // The server already removed these characters; nothing to
                // retain on the client side.
                let k = m.min(n);
                client_head = remainder_count(Retain(m), k).or_else(|| client_iter.next());
                server_head = remainder_count(Delete(n), k).or_else(|| server_iter.next());
            }

            (Insert(text), Insert(other)) => {
                // Same-position insert: server first, client second.
                result.push(Retain(OperationComponent::text_len(&other)));
                result.push(Insert(text));
                client_head = client_iter.next();
                server_head = server_iter.next();
            }

            (Insert(text), s) => {
                // Client insert lands before whatever the server did here.
                result.push(Insert(text));
                client_head = client_iter.next();
                server_head = Some(s);
            }

            (Delete(m), Retain(n)) => {
                let k = m.min(n);
                result.push(Delete(k));
                client_head = remainder_count(Delete(m), k).or_else(|| client_iter.next());
                server_head = remainder_count(Retain(n), k).or_else(|| server_iter.next());
            }

            (c @ Delete(_), Insert(text)) => {
                // Skip over the server's insert, keep deleting afterwards.
                result.push(Retain(OperationComponent::text_len(&text)));
                client_head = Some(c);
                server_head = server_iter.next();
            }

            (Delete(m), Delete(n)) => {
                // Both sides deleted the same characters: the server's
                // delete already happened, drop the overlap.
                let k = m.min(n);
                client_head = remainder_count(Delete(m), k).or_else(|| client_iter.next());
                server_head = remainder_count(Delete(n), k).or_else(|| server_iter.next());
            }
        }
    }

    result
}

/// Remainder of a counted component after consuming `k` characters.
///
/// Returns `None` when fully consumed. Insert components are never
/// partially consumed, so only `Retain`/`Delete` appear here.
fn remainder_count(component: OperationComponent, k: u64) -> Option<OperationComponent> {
    match component {
        OperationComponent::Retain(n) if n > k => Some(OperationComponent::Retain(n - k)),
        OperationComponent::Delete(n) if n > k => Some(OperationComponent::Delete(n - k)),
        _ => None,
    }
}
