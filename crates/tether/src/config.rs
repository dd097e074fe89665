//! Client configuration

use crate::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tether_ssh::Credentials;

/// Default chunk size for file transfers
pub const DEFAULT_BUFFER_SIZE: u32 = 32768;

/// Default transport connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for one remote host, immutable for the lifetime of a client
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Remote hostname or IP
    pub hostname: String,
    /// Remote port
    pub port: u16,
    /// Login name; empty means the invoking process's user
    pub user: String,
    /// Password for password and keyboard-interactive authentication
    pub password: Option<String>,
    /// Bytes requested per file-transfer chunk
    #[serde(rename = "buffersize", alias = "buffer_size")]
    pub buffer_size: u32,
    /// Timeout for connecting the transport and opening the file-transfer channel
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Default per-command timeout; `None` waits indefinitely
    #[serde(with = "opt_secs")]
    pub command_timeout: Option<Duration>,
    /// Chunk reads kept in flight during a download
    pub max_requests: usize,
    /// Reconnect policy
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 22,
            user: String::new(),
            password: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: None,
            max_requests: 1,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("buffer_size", &self.buffer_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("max_requests", &self.max_requests)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl ConnectionOptions {
    /// Options for `hostname` with every other setting at its default
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    /// Parse options from a JSON object
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ClientError::Config(format!("Invalid options: {}", e)))
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the login name
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the transfer chunk size
    pub fn with_buffer_size(mut self, buffer_size: u32) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the default command timeout
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set how many chunk reads a download keeps in flight
    pub fn with_max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Set the reconnect policy
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Check the options for values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(ClientError::Config("hostname must not be empty".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(ClientError::Config("buffersize must be positive".to_string()));
        }
        if self.max_requests == 0 {
            return Err(ClientError::Config("max_requests must be at least 1".to_string()));
        }
        self.reconnect.validate()
    }

    /// The login name, falling back to the process user when unset
    pub fn resolved_user(&self) -> Result<String> {
        if !self.user.is_empty() {
            return Ok(self.user.clone());
        }
        tracing::debug!("User not set. Falling back to process user.");

        ["LOGNAME", "USER", "USERNAME"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|user| !user.is_empty())
            .ok_or_else(|| {
                ClientError::Config(
                    "User not set and unable to determine from process user".to_string(),
                )
            })
    }

    /// Credentials presented during authentication
    pub fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials::new(self.resolved_user()?, self.password.clone()))
    }
}

/// How the client reconnects after a failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry after a success
    #[serde(with = "secs")]
    pub initial_delay: Duration,
    /// Upper bound for any delay
    #[serde(with = "secs")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub factor: f64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
    /// Consecutive rejected logins tolerated before giving up; `None` retries forever
    pub max_auth_failures: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
            factor: std::f64::consts::E,
            jitter: 0.0,
            max_auth_failures: Some(3),
        }
    }
}

impl ReconnectPolicy {
    /// Set the first delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the jitter fraction
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the tolerated number of consecutive rejected logins
    pub fn with_max_auth_failures(mut self, max: Option<u32>) -> Self {
        self.max_auth_failures = max;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_delay < self.initial_delay {
            return Err(ClientError::Config(
                "reconnect max_delay must not be below initial_delay".to_string(),
            ));
        }
        if !(self.factor >= 1.0) {
            return Err(ClientError::Config("reconnect factor must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ClientError::Config("reconnect jitter must be in [0, 1)".to_string()));
        }
        Ok(())
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
