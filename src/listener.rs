//! Embedder notification interface.
//!
//! The session hands decision points to the embedding application through
//! request objects.  Each request carries a one-shot reply channel; calling
//! `accept` or `reject` consumes the request.  Dropping a request without
//! answering counts as a rejection.

use cdp_proto::{AuthResponse, AuthResultCode};
use std::collections::HashMap;
use tokio::sync::oneshot;

/// Asks the embedder whether to proceed with a session against the
/// application identified by the handshake.
pub struct ApplicationAcceptanceRequest {
    pub host: String,
    pub port: u16,
    pub system_name: String,
    pub application_name: String,
    /// `"{major}.{minor}.{patch}"` as announced by the server.
    pub cdp_version: String,
    /// Free-form notice the embedder may need to display before use.
    pub system_use_notification: String,
    reply: oneshot::Sender<bool>,
}

impl ApplicationAcceptanceRequest {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        host: String,
        port: u16,
        system_name: String,
        application_name: String,
        cdp_version: String,
        system_use_notification: String,
        reply: oneshot::Sender<bool>,
    ) -> Self {
        Self {
            host,
            port,
            system_name,
            application_name,
            cdp_version,
            system_use_notification,
            reply,
        }
    }

    pub fn accept(self) {
        let _ = self.reply.send(true);
    }

    pub fn reject(self) {
        let _ = self.reply.send(false);
    }
}

/// Outcome of the previous authentication attempt, surfaced so the embedder
/// can react to expired passwords, lockouts and the like.
#[derive(Debug, Clone)]
pub struct UserAuthResult {
    pub code: AuthResultCode,
    pub text: String,
    /// Names of additional credential fields the server asked for.
    pub additional_credentials: Vec<String>,
}

impl UserAuthResult {
    pub(crate) fn from_response(response: &AuthResponse) -> Self {
        Self {
            code: response.result_code,
            text: response.result_text.clone(),
            additional_credentials: response.additional_challenge_response_required.clone(),
        }
    }
}

/// Asks the embedder for credentials, either for the initial handshake or a
/// re-authentication round.
pub struct CredentialsRequest {
    auth_result: Option<UserAuthResult>,
    reply: oneshot::Sender<Option<HashMap<String, String>>>,
}

impl CredentialsRequest {
    pub(crate) fn new(
        auth_result: Option<UserAuthResult>,
        reply: oneshot::Sender<Option<HashMap<String, String>>>,
    ) -> Self {
        Self { auth_result, reply }
    }

    /// The result of the previous attempt; `None` on the first prompt.
    pub fn user_auth_result(&self) -> Option<&UserAuthResult> {
        self.auth_result.as_ref()
    }

    /// Supply credentials.  `"Username"` and `"Password"` are required keys.
    pub fn accept(self, credentials: HashMap<String, String>) {
        let _ = self.reply.send(Some(credentials));
    }

    pub fn reject(self) {
        let _ = self.reply.send(None);
    }
}

/// Callbacks the embedding application supplies to the client.
///
/// The defaults accept every application and reject every credentials
/// prompt, which is sufficient against servers that do not require
/// authentication.
pub trait NotificationListener: Send + Sync {
    fn on_application_acceptance_requested(&self, request: ApplicationAcceptanceRequest) {
        request.accept();
    }

    fn on_credentials_requested(&self, request: CredentialsRequest) {
        request.reject();
    }
}

/// Listener with the default behavior for servers without authentication.
pub struct DefaultListener;

impl NotificationListener for DefaultListener {}
