//! Agent API client.
//!
//! The scheduler talks to agents over their HTTP surface: container CRUD
//! plus the `/containers` event stream. The [`AgentApi`] trait is the
//! seam representations are written against; tests swap in deterministic
//! fakes.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::warn;

use convoy_types::{ContainerConfig, Frame, FrameDecoder, StateEvent};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The remote answered 409; the state already holds.
    #[error("conflict")]
    Conflict,

    /// The remote answered 404.
    #[error("not found")]
    NotFound,

    #[error("http error: {0}")]
    Http(String),

    #[error("unexpected status {0}")]
    Status(u16),
}

/// One frame of an agent's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentFrame {
    /// Full state; first frame after every (re)connect.
    Snapshot(StateEvent),
    /// Changed instances only.
    Delta(StateEvent),
}

/// The agent HTTP surface the scheduler uses.
#[async_trait]
pub trait AgentApi: Send + Sync + 'static {
    /// Open the container event stream. The stream ends on connection
    /// loss; the caller owns reconnecting.
    async fn open_events(
        &self,
        endpoint: &str,
    ) -> Result<BoxStream<'static, AgentFrame>, ClientError>;

    async fn create_container(
        &self,
        endpoint: &str,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<(), ClientError>;

    async fn start_container(&self, endpoint: &str, id: &str) -> Result<(), ClientError>;

    async fn stop_container(&self, endpoint: &str, id: &str) -> Result<(), ClientError>;

    async fn destroy_container(&self, endpoint: &str, id: &str) -> Result<(), ClientError>;
}

/// reqwest-backed [`AgentApi`].
pub struct HttpAgentClient {
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn base_url(endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            format!("{endpoint}/api/v0")
        } else {
            format!("http://{endpoint}/api/v0")
        }
    }

    fn check(response: reqwest::Response) -> Result<(), ClientError> {
        match response.status().as_u16() {
            200..=299 => Ok(()),
            404 => Err(ClientError::NotFound),
            409 => Err(ClientError::Conflict),
            status => Err(ClientError::Status(status)),
        }
    }
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn open_events(
        &self,
        endpoint: &str,
    ) -> Result<BoxStream<'static, AgentFrame>, ClientError> {
        let url = format!("{}/containers", Self::base_url(endpoint));
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::Status(response.status().as_u16()));
        }

        let stream = response
            .bytes_stream()
            .take_while(|chunk| futures_util::future::ready(chunk.is_ok()))
            .filter_map(|chunk| futures_util::future::ready(chunk.ok()))
            .scan(FrameDecoder::new(), |decoder, bytes| {
                futures_util::future::ready(Some(futures_util::stream::iter(
                    decoder.feed(&bytes),
                )))
            })
            .flatten()
            .filter_map(|frame| futures_util::future::ready(decode_frame(frame)));

        Ok(stream.boxed())
    }

    async fn create_container(
        &self,
        endpoint: &str,
        id: &str,
        config: &ContainerConfig,
    ) -> Result<(), ClientError> {
        let url = format!("{}/containers/{id}", Self::base_url(endpoint));
        let response = self
            .client
            .put(&url)
            .json(config)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Self::check(response)
    }

    async fn start_container(&self, endpoint: &str, id: &str) -> Result<(), ClientError> {
        let url = format!("{}/containers/{id}/start", Self::base_url(endpoint));
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Self::check(response)
    }

    async fn stop_container(&self, endpoint: &str, id: &str) -> Result<(), ClientError> {
        let url = format!("{}/containers/{id}/stop", Self::base_url(endpoint));
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Self::check(response)
    }

    async fn destroy_container(&self, endpoint: &str, id: &str) -> Result<(), ClientError> {
        let url = format!("{}/containers/{id}", Self::base_url(endpoint));
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Self::check(response)
    }
}

fn decode_frame(frame: Frame) -> Option<AgentFrame> {
    let parse = |data: &str| match serde_json::from_str::<StateEvent>(data) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "undecodable state frame");
            None
        }
    };

    match frame.event.as_str() {
        "snapshot" => parse(&frame.data).map(AgentFrame::Snapshot),
        "delta" => parse(&frame.data).map(AgentFrame::Delta),
        _ => None,
    }
}
