//! Per-tenant mailbox: authenticated sessions, the sync engine and the
//! administrative service built on top of them.

pub mod service;
pub mod session;
pub mod sync;

pub use service::{
    AttachmentDownload, CallbackOutcome, MailboxNotification, MailboxService,
    MailboxServiceError, MailboxStatus, PushEnvelope, PushMessage, USER_DISCONNECT_REASON,
};
pub use session::{
    MailboxClient, MailboxConnector, MailboxSession, SessionError, UNREADABLE_CREDENTIAL_REASON,
};
pub use sync::{MailboxSyncEngine, SyncError, SyncMode, SyncOptions, SyncReport};
