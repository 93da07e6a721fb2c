pub mod client;
pub mod mime_builder;
pub mod oauth;
pub mod parser;
pub mod types;

pub use client::{
    ErrorClass, GmailClient, GmailClientError, REFRESH_FAILED_REASON, build_http_client,
};
pub use mime_builder::{EmailAddress, MailEnvelope, MimeAttachment, MimeBuildError};
pub use oauth::{
    ConnectState, DEFAULT_REFRESH_BUFFER, NoopTokenStore, OAuthApp, OAuthError, OAuthTokens,
    TokenStore,
};
pub use parser::{AttachmentMeta, ParsedMessage, Recipient, parse_message};
pub use types::*;
