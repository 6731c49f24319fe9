//! Tunnel configuration values.
//!
//! Configuration is built once in `main` from the command line and passed
//! down explicitly; apart from the logger there is no process-wide state.
//! Both structs serialize so startup can log the effective configuration
//! (the token never leaves the process).

use std::time::Duration;

use serde::Serialize;

use crate::constants::{RESUME_TIMEOUT, SERVER_WRITE_TIMEOUT};

/// Configuration of the server end.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// TCP address to listen on, e.g. `0.0.0.0:8080`.
    pub listen: String,
    /// Shared token - NOT serialized into logs.
    #[serde(skip)]
    pub token: String,
    /// Private key for keyed mode (base64); `None` means token auth only.
    #[serde(skip)]
    pub key: Option<String>,
    /// How long a broken session waits for the client to resume.
    #[serde(with = "humantime_ish")]
    pub resume_timeout: Duration,
    /// Per-frame carrier write deadline.
    #[serde(with = "humantime_ish")]
    pub write_timeout: Duration,
}

impl ServerConfig {
    /// Server configuration with the default timeouts.
    #[must_use]
    pub fn new(listen: String, token: String, key: Option<String>) -> Self {
        Self {
            listen,
            token,
            key,
            resume_timeout: RESUME_TIMEOUT,
            write_timeout: SERVER_WRITE_TIMEOUT,
        }
    }
}

/// Configuration of the client end.
#[derive(Debug, Clone, Serialize)]
pub struct ClientConfig {
    /// Server endpoint. `ws(s)://` selects the resumable WebSocket
    /// carrier, `http(s)://` the stateless Upgrade carrier. A bare
    /// `host:port` defaults to `http://`.
    pub endpoint: String,
    /// Shared token - NOT serialized into logs.
    #[serde(skip)]
    pub token: String,
    /// Server public key for keyed mode (base64).
    #[serde(skip)]
    pub key: Option<String>,
    /// Destination `host:port` the server should dial per connection.
    pub destination: String,
    /// Local listen address; `None` wraps stdio instead.
    pub listen: Option<String>,
    /// Overrides the HTTP client's default User-Agent.
    pub user_agent: Option<String>,
}

impl ClientConfig {
    /// Normalize the endpoint: a scheme-less endpoint defaults to http.
    #[must_use]
    pub fn normalized_endpoint(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else {
            format!("http://{}", self.endpoint)
        }
    }

    /// Whether the endpoint selects the resumable WebSocket variant.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        let endpoint = self.normalized_endpoint();
        endpoint.starts_with("ws://") || endpoint.starts_with("wss://")
    }
}

/// Serialize a Duration as whole seconds for the startup dump.
mod humantime_ish {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
