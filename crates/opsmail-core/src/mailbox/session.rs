use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::config::GoogleConfig;
use crate::gmail::{
    GmailClient, NoopTokenStore, OAuthApp, OAuthTokens, REFRESH_FAILED_REASON, TokenStore,
};
use crate::integrations::{
    IntegrationError, IntegrationRepository, IntegrationTokenStore, MailboxIntegration,
};
use crate::vault::{CredentialVault, VaultError};

pub type MailboxClient = GmailClient<IntegrationTokenStore>;

pub const UNREADABLE_CREDENTIAL_REASON: &str =
    "Stored credential could not be decrypted. Please reconnect.";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("mailbox is not connected for tenant {0}")]
    NotConnected(String),
    /// The grant was dropped after a failed refresh or an unreadable
    /// credential. The tenant has to authorize again.
    #[error("mailbox authorization expired: {0}")]
    AuthExpired(String),
    #[error("stored credential is unusable: {0}")]
    Decryption(VaultError),
    #[error(transparent)]
    Integration(#[from] IntegrationError),
}

/// Why a tenant without a usable grant cannot open a session. A grant the
/// system dropped stays `AuthExpired` until the tenant reconnects.
pub fn unusable_integration(integration: &MailboxIntegration) -> SessionError {
    match integration.state.reason.as_deref() {
        Some(reason)
            if !integration.is_connected()
                && (reason == REFRESH_FAILED_REASON || reason == UNREADABLE_CREDENTIAL_REASON) =>
        {
            SessionError::AuthExpired(reason.to_string())
        }
        _ => SessionError::NotConnected(integration.tenant_id.clone()),
    }
}

/// An authenticated client bound to one tenant's integration.
pub struct MailboxSession {
    pub integration: MailboxIntegration,
    pub client: MailboxClient,
}

impl MailboxSession {
    /// The connected mailbox address, lowercased.
    pub fn address(&self) -> String {
        self.integration
            .email
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase()
    }
}

/// Opens provider sessions from stored, encrypted credentials.
#[derive(Clone)]
pub struct MailboxConnector {
    http: reqwest::Client,
    vault: Arc<CredentialVault>,
    integrations: IntegrationRepository,
    google: GoogleConfig,
}

impl MailboxConnector {
    pub fn new(
        http: reqwest::Client,
        vault: Arc<CredentialVault>,
        integrations: IntegrationRepository,
        google: GoogleConfig,
    ) -> Self {
        Self {
            http,
            vault,
            integrations,
            google,
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn integrations(&self) -> &IntegrationRepository {
        &self.integrations
    }

    pub fn google(&self) -> &GoogleConfig {
        &self.google
    }

    pub fn oauth_app(&self) -> OAuthApp {
        let mut app = OAuthApp::new(
            &self.google.client_id,
            &self.google.client_secret,
            &self.google.redirect_uri,
        );
        if let Some(endpoint) = &self.google.auth_endpoint {
            app = app.with_auth_endpoint(endpoint);
        }
        if let Some(endpoint) = &self.google.token_endpoint {
            app = app.with_token_endpoint(endpoint);
        }
        app
    }

    /// Session for the tenant's integration. Fails with `NotConnected`, or
    /// `AuthExpired` when the last grant was revoked by a failed refresh.
    pub async fn open(&self, tenant_id: &str) -> Result<MailboxSession, SessionError> {
        match self.integrations.find_by_tenant(tenant_id).await? {
            Some(integration) => self.session_for(integration).await,
            None => Err(SessionError::NotConnected(tenant_id.to_string())),
        }
    }

    /// A credential that no longer decrypts is dropped so the tenant is asked
    /// to authorize again.
    pub async fn session_for(
        &self,
        integration: MailboxIntegration,
    ) -> Result<MailboxSession, SessionError> {
        let tenant_id = integration.tenant_id.clone();
        let credential = match (&integration.credential, integration.is_connected()) {
            (Some(credential), true) => credential,
            _ => return Err(unusable_integration(&integration)),
        };

        let tokens = match credential.open(&self.vault) {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(tenant_id = %tenant_id, error = %err, "stored mailbox credential unusable");
                self.integrations
                    .disconnect(&tenant_id, UNREADABLE_CREDENTIAL_REASON)
                    .await?;
                return Err(SessionError::Decryption(err));
            }
        };

        let store = IntegrationTokenStore::new(
            self.integrations.clone(),
            self.vault.clone(),
            tenant_id,
        );
        Ok(MailboxSession {
            integration,
            client: self.client_with_store(tokens, Arc::new(store)),
        })
    }

    /// Client for freshly exchanged tokens that are not stored yet.
    pub fn detached_client(&self, tokens: OAuthTokens) -> GmailClient<NoopTokenStore> {
        self.client_with_store(tokens, Arc::new(NoopTokenStore))
    }

    fn client_with_store<S: TokenStore>(
        &self,
        tokens: OAuthTokens,
        store: Arc<S>,
    ) -> GmailClient<S> {
        let mut client = GmailClient::new(
            self.http.clone(),
            "me",
            &self.google.client_id,
            &self.google.client_secret,
            tokens,
            store,
        );
        if let Some(base) = &self.google.api_base {
            client = client.with_api_base(base);
        }
        if let Some(endpoint) = &self.google.token_endpoint {
            client = client.with_token_endpoint(endpoint);
        }
        client
    }
}
