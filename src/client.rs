//! Client end of the tunnel.
//!
//! Accepts local TCP connections (or wraps stdio) and forwards each one to
//! the configured destination through the server. The carrier variant
//! follows the endpoint scheme: `ws(s)://` endpoints get a resumable
//! WebSocket session, `http(s)://` endpoints get a stateless
//! `http2tcp/1.0` Upgrade hijack.

use anyhow::{Context, Result};
use reqwest::header;
use tokio::net::TcpListener;

use crate::auth;
use crate::carrier::stream::StreamCarrier;
use crate::config::ClientConfig;
use crate::constants::ACCEPT_BACKOFF;
use crate::crypto;
use crate::session::{LocalReader, LocalWriter, Session};
use crate::stdio;

/// The tunnel client.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Build a client from its configuration.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Run until the process ends: either the local accept loop, or a
    /// single stdio session.
    ///
    /// # Errors
    ///
    /// Returns an error when the listen address cannot be bound.
    pub async fn run(&self) -> Result<()> {
        match self.config.listen.clone() {
            Some(listen) => {
                let listener = TcpListener::bind(&listen)
                    .await
                    .with_context(|| format!("failed to listen on {listen}"))?;
                self.serve(listener).await
            }
            None => {
                let (reader, writer) = stdio::stdio();
                self.proxy(reader, writer).await
            }
        }
    }

    /// Accept local connections forever, one session per connection.
    /// Accept errors are logged and retried after a backoff.
    ///
    /// # Errors
    ///
    /// Currently never returns; the `Result` keeps the signature uniform
    /// with [`Client::run`].
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        log::info!(
            "client listening on {} towards {} via {} ({})",
            listener.local_addr().context("listener address")?,
            self.config.destination,
            self.config.endpoint,
            serde_json::to_string(&self.config).unwrap_or_default()
        );

        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    log::debug!("accepted {peer}");
                    let client = self.clone();
                    tokio::spawn(async move {
                        let (reader, writer) = conn.into_split();
                        if let Err(e) = client.proxy(Box::new(reader), Box::new(writer)).await {
                            log::warn!("tunnel for {peer} failed: {e:#}");
                        }
                    });
                }
                Err(e) => {
                    log::warn!("accept failed, backing off: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Tunnel one local byte stream to the destination. Returns when the
    /// session ends.
    ///
    /// # Errors
    ///
    /// Returns an error when the session cannot be established at all; a
    /// session that ends after establishment is a clean return.
    pub async fn proxy(&self, local_reader: LocalReader, local_writer: LocalWriter) -> Result<()> {
        if self.config.is_resumable() {
            self.proxy_resumable(local_reader, local_writer).await
        } else {
            self.proxy_hijack(local_reader, local_writer).await
        }
    }

    async fn proxy_resumable(
        &self,
        local_reader: LocalReader,
        local_writer: LocalWriter,
    ) -> Result<()> {
        let session = Session::connect(
            &self.config.normalized_endpoint(),
            &self.config.token,
            self.config.user_agent.as_deref(),
            &self.config.destination,
        )
        .await
        .context("failed to establish session")?;
        session.run(local_reader, local_writer).await;
        Ok(())
    }

    async fn proxy_hijack(
        &self,
        local_reader: LocalReader,
        local_writer: LocalWriter,
    ) -> Result<()> {
        let upgraded = self
            .dial_upgrade()
            .await
            .context("failed to establish tunnel")?;
        let carrier = std::sync::Arc::new(StreamCarrier::new(upgraded, None));
        let session = Session::stateless(0, false, carrier);
        session.run(local_reader, local_writer).await;
        Ok(())
    }

    /// Perform the `http2tcp/1.0` Upgrade handshake and return the
    /// hijacked byte stream.
    async fn dial_upgrade(&self) -> Result<reqwest::Upgraded> {
        let endpoint = self.config.normalized_endpoint();
        let mut url = reqwest::Url::parse(&endpoint)
            .with_context(|| format!("invalid endpoint: {endpoint}"))?;

        let client = reqwest::Client::new();
        let mut request = if let Some(key) = self.config.key.as_deref() {
            // Keyed mode: the sealed destination body is the credential.
            let sealed = crypto::seal_destination(key, &self.config.destination)
                .context("failed to seal destination")?;
            client.post(url).body(sealed)
        } else {
            url.query_pairs_mut()
                .append_pair("addr", &self.config.destination);
            client.get(url).header(
                header::AUTHORIZATION,
                auth::format_authorization(&self.config.token),
            )
        };

        request = request
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, auth::UPGRADE_PROTOCOL);
        if let Some(agent) = self.config.user_agent.as_deref() {
            request = request.header(header::USER_AGENT, agent);
        }

        let response = request.send().await.context("upgrade request failed")?;
        let status = response.status();
        if status != reqwest::StatusCode::SWITCHING_PROTOCOLS {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("server refused upgrade: {status} {}", body.trim());
        }

        response
            .upgrade()
            .await
            .context("failed to hijack the upgraded connection")
    }
}
