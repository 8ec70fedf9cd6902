//! eventsync core library
//!
//! Shared types for the eventsync server and device clients: the document
//! model, the permission engine, the wire protocol and sync state.

pub mod document;
pub mod error;
pub mod permission;
pub mod protocol;
pub mod state;
pub mod timestamp;

pub use document::{DeletionRecord, DocumentMetadata, RetentionPriority, SyncDocument};
pub use error::CoreError;
pub use permission::{
    check, AccessContext, Action, GroupId, GroupPermission, Permission, PermissionCheck,
    PermissionLevel, PermissionScope, Principal,
};
pub use protocol::{
    ClearedPayload, DeletedPayload, HealthResponse, MeResponse, PageCursor, RawSyncResponse,
    ScanKey, ServerEvent, SyncRequest, SyncResponse, SyncToken, DEFAULT_PAGE_LIMIT,
    MAX_PAGE_LIMIT,
};
pub use state::{SyncState, SyncStatus};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
