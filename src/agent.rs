//! Per-container management agent client
//!
//! The agent runs inside every server container and is reached over the
//! container's published port. Requests authenticate with the container's
//! token in an `auth` header.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{future, Stream, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::config::AgentConfig;
use crate::{Error, Result};

pub const AUTH_HEADER: &str = "auth";

/// Response of `GET /`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AgentStatus {
    #[serde(default)]
    pub server: GameServerState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct GameServerState {
    #[serde(default)]
    pub running: bool,
}

impl AgentStatus {
    pub fn running(running: bool) -> Self {
        Self {
            server: GameServerState { running },
        }
    }

    pub fn is_running(&self) -> bool {
        self.server.running
    }
}

/// One frame of the world creation status channel
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WorldCreationStatus {
    pub status: String,
    #[serde(default)]
    pub world_status: f64,
}

impl WorldCreationStatus {
    /// Completion percentage; an already running world counts as complete
    pub fn percent(&self) -> u8 {
        if self.status == "already running" {
            return 100;
        }
        self.world_status.clamp(0.0, 100.0) as u8
    }
}

/// World generation progress, in percent. Ends after 100 is seen, when the
/// channel closes, or on the first transport error.
pub type ProgressStream = BoxStream<'static, u8>;

#[async_trait]
pub trait ManagementAgent: Send + Sync {
    async fn status(&self, port: u16, auth_key: &str) -> Result<AgentStatus>;

    /// Boot the game world and block until it is up
    async fn start_and_wait(&self, port: u16, auth_key: &str) -> Result<()>;

    async fn world_progress(&self, port: u16, auth_key: &str) -> Result<ProgressStream>;

    /// Broadcast a chat message to players on the server
    async fn send_message(&self, port: u16, auth_key: &str, message: &str) -> Result<()>;
}

/// HTTP + WebSocket agent client
pub struct HttpAgent {
    client: reqwest::Client,
    host: String,
    start_timeout: Duration,
}

impl HttpAgent {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            host: config.host.clone(),
            start_timeout: config.start_timeout(),
        })
    }

    fn url(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.host, port, path)
    }

    fn ws_url(&self, port: u16, path: &str) -> String {
        format!("ws://{}:{}{}", self.host, port, path)
    }
}

#[async_trait]
impl ManagementAgent for HttpAgent {
    async fn status(&self, port: u16, auth_key: &str) -> Result<AgentStatus> {
        let response = self
            .client
            .get(self.url(port, "/"))
            .header(AUTH_HEADER, auth_key)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn start_and_wait(&self, port: u16, auth_key: &str) -> Result<()> {
        tracing::debug!(port, "Starting world");
        self.client
            .get(self.url(port, "/server/start?blocking=true"))
            .header(AUTH_HEADER, auth_key)
            .timeout(self.start_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn world_progress(&self, port: u16, auth_key: &str) -> Result<ProgressStream> {
        let mut request = self
            .ws_url(port, "/server/world/creation_status")
            .into_client_request()?;
        let auth = HeaderValue::from_str(auth_key)
            .map_err(|e| Error::Agent(format!("invalid auth token: {}", e)))?;
        request.headers_mut().insert(AUTH_HEADER, auth);

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        Ok(progress_from_messages(socket))
    }

    async fn send_message(&self, port: u16, auth_key: &str, message: &str) -> Result<()> {
        self.client
            .post(self.url(port, "/server/message/send"))
            .header(AUTH_HEADER, auth_key)
            .form(&[("message", message)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Decode world status frames into percentages, stopping after 100
fn progress_from_messages<S, E>(messages: S) -> ProgressStream
where
    S: Stream<Item = std::result::Result<Message, E>> + Send + 'static,
    E: Send + 'static,
{
    messages
        .take_while(|msg| future::ready(msg.is_ok()))
        .filter_map(|msg| {
            let percent = match msg {
                Ok(Message::Text(text)) => serde_json::from_str::<WorldCreationStatus>(text.as_str())
                    .ok()
                    .map(|status| status.percent()),
                _ => None,
            };
            future::ready(percent)
        })
        .scan(false, |complete, percent| {
            if *complete {
                return future::ready(None);
            }
            *complete = percent >= 100;
            future::ready(Some(percent))
        })
        .boxed()
}

/// A progress stream that yields nothing
pub fn no_progress() -> ProgressStream {
    stream::empty().boxed()
}
