//! Engine abstraction: connecting, securing and authenticating a transport

use async_trait::async_trait;
use crate::{ChannelOpenError, SessionChannel, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Entry point of an SSH implementation
#[async_trait]
pub trait SshEngine: Send + Sync {
    /// Open a TCP transport to the remote host
    async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// A transport that has reached the remote host but is not yet authenticated
#[async_trait]
pub trait Transport: Send {
    /// Wait until key exchange has finished and the transport is secure
    async fn secure(&mut self) -> Result<(), TransportError>;

    /// Present credentials and, on success, yield the authenticated connection
    ///
    /// Returns [`TransportError::Declined`] when the credentials carry nothing
    /// the server would accept, rather than failing repeatedly.
    async fn authenticate(
        self: Box<Self>,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An authenticated connection able to multiplex channels
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new session channel
    async fn open_session(&self) -> Result<Box<dyn SessionChannel>, ChannelOpenError>;

    /// Resolve once the connection has been lost, yielding the reason
    async fn closed(&self) -> TransportError;

    /// Forcibly close the connection
    async fn disconnect(&self);

    /// Whether the connection is already closed
    fn is_closed(&self) -> bool;
}

/// Credentials presented during user authentication
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name
    pub user: String,
    /// Password, if one was configured
    pub password: Option<String>,
}

impl Credentials {
    /// Create new credentials
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password: password.filter(|p| !p.is_empty()),
        }
    }

    /// The password to send, or a decline when none is configured
    pub fn password(&self) -> Result<&str, TransportError> {
        self.password
            .as_deref()
            .ok_or_else(|| TransportError::Declined("no password set in options".to_string()))
    }

    /// Answer keyboard-interactive prompts
    ///
    /// Every prompt mentioning a password is answered with the configured
    /// password; an empty prompt list gets an empty answer list.
    pub fn answer_prompts(&self, prompts: &[(String, bool)]) -> Vec<String> {
        let mut responses = Vec::new();
        let mut found_prompt = false;

        for (prompt, _echo) in prompts {
            if prompt.to_lowercase().contains("password") {
                found_prompt = true;
                if let Some(password) = &self.password {
                    responses.push(password.clone());
                }
            }
        }

        if !prompts.is_empty() && !found_prompt {
            tracing::warn!("No known prompts: {:?}", prompts);
        }
        responses
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
