//! The list/watch contract a remote collection is consumed through.

use std::sync::Arc;

use futures::stream::BoxStream;

/// Request options for list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Starting version token for a watch; unset for a full list.
    pub resource_version: Option<String>,
    pub timeout_seconds: Option<u32>,
    pub allow_bookmarks: bool,
}

/// Caller hook narrowing every list/watch request before it is issued.
pub type TweakListOptions = Arc<dyn Fn(&mut ListOptions) + Send + Sync>;

/// Full snapshot of the collection plus its collection-level version token.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<serde_json::Value>,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(serde_json::Value),
    Modified(serde_json::Value),
    Deleted(serde_json::Value),
    /// Progress notification: the collection reached this version, nothing changed.
    Bookmark(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    /// The requested starting version is no longer available; relist.
    #[error("resource version gone: {0}")]
    Gone(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("malformed: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn is_gone(&self) -> bool {
        matches!(self, SourceError::Gone(_))
    }
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, SourceError>>;

/// A remote collection that can be listed in bulk and watched incrementally.
#[async_trait::async_trait]
pub trait ListWatch: Send + Sync {
    async fn list(&self, opts: &ListOptions) -> Result<ObjectList, SourceError>;

    /// Open a change stream starting after `opts.resource_version`. The stream ends
    /// on server-side expiry or connection loss.
    async fn watch(&self, opts: &ListOptions) -> Result<WatchStream, SourceError>;
}
