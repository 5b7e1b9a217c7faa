//! Seams to the collaborators the core consumes but does not own.
//!
//! Authorization decisions and character-level content storage live
//! outside the collaboration core — the core only dictates position and
//! length deltas. Both collaborators are async traits so a database-backed
//! implementation drops in without touching the protocol handler; the
//! in-memory implementations here back tests and single-process setups.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::transform::{Operation, OperationComponent};

/// Document content plus the version it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentSnapshot {
    pub content: String,
    pub version: u64,
}

/// Content store failures.
#[derive(Debug, Clone)]
pub enum ContentError {
    /// Document does not exist.
    NotFound(Uuid),
    /// A mutation addressed a position outside the document.
    InvalidPosition {
        document_id: Uuid,
        position: u64,
        length: u64,
    },
    /// Store unreachable or failed internally.
    Unavailable(String),
}

impl std::fmt::Display for ContentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentError::NotFound(id) => write!(f, "Document not found: {id}"),
            ContentError::InvalidPosition {
                document_id,
                position,
                length,
            } => write!(
                f,
                "Position {position} out of bounds for document {document_id} (length {length})"
            ),
            ContentError::Unavailable(e) => write!(f, "Content store unavailable: {e}"),
        }
    }
}

impl std::error::Error for ContentError {}

/// Authorization collaborator: may this user open this document?
#[async_trait]
pub trait AccessControl: Send + Sync {
    async fn is_authorized(&self, document_id: Uuid, user_id: Uuid) -> bool;
}

/// Grants everyone access. For tests and trusted single-tenant setups.
pub struct AllowAll;

#[async_trait]
impl AccessControl for AllowAll {
    async fn is_authorized(&self, _document_id: Uuid, _user_id: Uuid) -> bool {
        true
    }
}

/// Denies everyone. For exercising the permission-denied path.
pub struct DenyAll;

#[async_trait]
impl AccessControl for DenyAll {
    async fn is_authorized(&self, _document_id: Uuid, _user_id: Uuid) -> bool {
        false
    }
}

/// Character-level content collaborator.
///
/// Must support position-addressed mutation without requiring the caller
/// to round-trip the whole document.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Current content and the version it reflects.
    async fn snapshot(&self, document_id: Uuid) -> Result<ContentSnapshot, ContentError>;

    /// Apply one insert or delete at a character position. `Retain` never
    /// reaches the store — it only moves the position cursor.
    async fn apply(
        &self,
        document_id: Uuid,
        position: u64,
        component: &OperationComponent,
    ) -> Result<(), ContentError>;

    /// Record that the stored content now reflects `version`.
    async fn set_version(&self, document_id: Uuid, version: u64) -> Result<(), ContentError>;
}

/// Walk a committed operation and delegate each mutation to the store.
///
/// Retains advance the position cursor; inserts advance it past the new
/// text; deletes leave it in place. Finishes by stamping the new version.
pub async fn apply_operation(
    store: &dyn ContentStore,
    op: &Operation,
    new_version: u64,
) -> Result<(), ContentError> {
    let mut position = 0u64;
    for component in &op.components {
        match component {
            OperationComponent::Retain(n) => position += n,
            OperationComponent::Insert(text) => {
                store.apply(op.document_id, position, component).await?;
                position += OperationComponent::text_len(text);
            }
            OperationComponent::Delete(_) => {
                store.apply(op.document_id, position, component).await?;
            }
        }
    }
    store.set_version(op.document_id, new_version).await
}

/// In-memory content store.
pub struct MemoryContentStore {
    documents: RwLock<HashMap<Uuid, StoredDocument>>,
}

struct StoredDocument {
    chars: Vec<char>,
    version: u64,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
        }
    }

    /// Seed a document at version 0.
    pub async fn create_document(&self, document_id: Uuid, content: impl Into<String>) {
        let mut documents = self.documents.write().await;
        documents.insert(
            document_id,
            StoredDocument {
                chars: content.into().chars().collect(),
                version: 0,
            },
        );
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn snapshot(&self, document_id: Uuid) -> Result<ContentSnapshot, ContentError> {
        let documents = self.documents.read().await;
        let doc = documents
            .get(&document_id)
            .ok_or(ContentError::NotFound(document_id))?;
        Ok(ContentSnapshot {
            content: doc.chars.iter().collect(),
            version: doc.version,
        })
    }

    async fn apply(
        &self,
        document_id: Uuid,
        position: u64,
        component: &OperationComponent,
    ) -> Result<(), ContentError> {
        let mut documents = self.documents.write().await;
        let doc = documents
            .get_mut(&document_id)
            .ok_or(ContentError::NotFound(document_id))?;
        let length = doc.chars.len() as u64;

        match component {
            OperationComponent::Retain(_) => Ok(()),
            OperationComponent::Insert(text) => {
                if position > length {
                    return Err(ContentError::InvalidPosition {
                        document_id,
                        position,
                        length,
                    });
                }
                for (i, ch) in text.chars().enumerate() {
                    doc.chars.insert(position as usize + i, ch);
                }
                Ok(())
            }
            OperationComponent::Delete(count) => {
                if position + count > length {
                    return Err(ContentError::InvalidPosition {
                        document_id,
                        position,
                        length,
                    });
                }
                doc.chars
                    .drain(position as usize..(position + count) as usize);
                Ok(())
            }
        }
    }

    async fn set_version(&self, document_id: Uuid, version: u64) -> Result<(), ContentError> {
        let mut documents = self.documents.write().await;
        let doc = documents
            .get_mut(&document_id)
            .ok_or(ContentError::NotFound(document_id))?;
        doc.version = version;
        Ok(())
    }
}
