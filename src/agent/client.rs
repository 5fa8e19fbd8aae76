//! HTTP client for the server's manifest and data endpoints.

use futures::TryStreamExt;
use http::Request;
use hyper::client::HttpConnector;
use hyper::Body;
use snafu::{ResultExt, Snafu};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use outpost_sse::{DecodeError, EventStreamDecoder, Message, CONTENT_TYPE};
use outpost_sync::suid::{AssembleManifest, Suid};

use crate::server::{INSTANCE_HEADER, MANIFEST_HEADER, NODE_HEADER, STATE_HEADER};

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("invalid request: {source}"))]
    BuildRequest { source: http::Error },

    #[snafu(display("request failed: {source}"))]
    Request { source: hyper::Error },

    #[snafu(display("server rejected the call ({status}): {text}"))]
    Status {
        status: http::StatusCode,
        text: String,
    },

    #[snafu(display("invalid manifest in response: {source}"))]
    DecodeManifest { source: serde_json::Error },

    #[snafu(display("event stream failed: {source}"))]
    Stream { source: DecodeError },

    #[snafu(display("server reported: {text}"))]
    Remote { text: String },

    #[snafu(display("message handling failed: {source}"))]
    Handle {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// One agent's connection to the server.
///
/// The instance header from the last manifest call is echoed on data
/// calls so a stateful reverse proxy keeps the exchange pinned to one
/// server process.
#[derive(Debug)]
pub struct Client {
    http: hyper::Client<HttpConnector>,
    host: String,
    node: String,
    instance: String,
}

impl Client {
    pub fn new(host: impl Into<String>, node: impl Into<String>) -> Self {
        let host = host.into();
        Client {
            http: hyper::Client::new(),
            host: host.trim_end_matches('/').to_owned(),
            node: node.into(),
            instance: String::new(),
        }
    }

    /// The server instance the session is pinned to, if any yet.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Fetches the next manifest page for `state`.
    pub async fn manifest(&mut self, state: &Suid) -> Result<AssembleManifest, ClientError> {
        let request = Request::get(format!("{}/api/v1/manifest", self.host))
            .header(NODE_HEADER, &self.node)
            .header(STATE_HEADER, state.to_string())
            .body(Body::empty())
            .context(BuildRequestSnafu)?;

        let response = self.http.request(request).await.context(RequestSnafu)?;
        let instance = response
            .headers()
            .get(INSTANCE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .context(RequestSnafu)?;
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                text: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let manifest: AssembleManifest =
            serde_json::from_slice(&body).context(DecodeManifestSnafu)?;
        debug!(
            message = "Fetched manifest page.",
            entries = manifest.len(),
            instance = %instance,
        );
        self.instance = instance;
        Ok(manifest)
    }

    /// Streams the data for `manifest`, invoking `handle` for every
    /// non-sentinel message until the stream ends.
    pub async fn data<F>(
        &self,
        manifest: &AssembleManifest,
        mut handle: F,
    ) -> Result<(), ClientError>
    where
        F: FnMut(&Message) -> Result<(), Box<dyn std::error::Error + Send + Sync>>,
    {
        let encoded = serde_json::to_string(manifest).context(DecodeManifestSnafu)?;
        let request = Request::get(format!("{}/api/v1/data", self.host))
            .header(NODE_HEADER, &self.node)
            .header(INSTANCE_HEADER, &self.instance)
            .header(MANIFEST_HEADER, encoded)
            .header(http::header::ACCEPT, CONTENT_TYPE)
            .header(http::header::CACHE_CONTROL, "no-cache")
            .body(Body::empty())
            .context(BuildRequestSnafu)?;

        let response = self.http.request(request).await.context(RequestSnafu)?;
        let status = response.status();
        if !status.is_success() {
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .context(RequestSnafu)?;
            return Err(ClientError::Status {
                status,
                text: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let reader = StreamReader::new(
            response
                .into_body()
                .map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error)),
        );
        let mut messages = FramedRead::new(reader, EventStreamDecoder::new());
        while let Some(message) = messages.try_next().await.context(StreamSnafu)? {
            if message.is_eof() {
                return Ok(());
            }
            if message.is_error() {
                return Err(ClientError::Remote { text: message.data });
            }
            handle(&message).map_err(|source| ClientError::Handle { source })?;
        }
        Ok(())
    }
}
