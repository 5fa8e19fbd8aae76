//! The HTTP surface agents talk to.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::StreamBody;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder as _;
use tracing::{debug, error};

use outpost_sse::{EventStreamEncoder, Message, CONTENT_TYPE};
use outpost_sync::suid::{AssembleManifest, Suid};

use super::authorize;
use super::ServerContext;

/// Response header carrying the server instance so stateful proxies can
/// pin an agent's consecutive calls to one process.
pub const INSTANCE_HEADER: &str = "outpost-mgt-server-instance";

/// Request header naming the calling agent.
pub const NODE_HEADER: &str = "node";

/// Request header carrying the agent's cursor.
pub const STATE_HEADER: &str = "state";

/// Request header carrying the JSON-encoded manifest on data calls.
pub const MANIFEST_HEADER: &str = "manifest";

fn bad_request(text: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, text.into()).into_response()
}

fn internal_error(error: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// `GET /api/v1/manifest`: one bounded page of the agent's queue.
pub async fn manifest(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
) -> Response {
    let Some(node) = header(&headers, NODE_HEADER).filter(|n| !n.is_empty()) else {
        return bad_request("missing node header");
    };
    let state = match Suid::parse(header(&headers, STATE_HEADER).unwrap_or_default()) {
        Ok(state) => state,
        Err(error) => return bad_request(format!("invalid state header: {error}")),
    };

    // First contact: resolve the agent's scopes and seed its queue.
    if !ctx.node_set.has(node) {
        if let Err(error) = authorize::resolve(
            ctx.kube.as_ref(),
            &ctx.node_set,
            &ctx.instance,
            node,
        )
        .await
        {
            error!(message = "Agent authorisation failed.", %node, %error);
            return internal_error(error);
        }
    }

    let result = ctx
        .instance
        .syncer(node)
        .manifest(&state, ctx.config.manifest_limit);
    let manifest = match result {
        Ok(manifest) => manifest,
        // Caught up: an empty manifest tells the agent to sleep.
        Err(outpost_sync::Error::EmptyManifest) => AssembleManifest::new(),
        Err(error) => {
            error!(message = "Manifest assembly failed.", %node, %error);
            return internal_error(error);
        }
    };

    debug!(message = "Serving manifest page.", %node, entries = manifest.len());
    ([(INSTANCE_HEADER, ctx.instance_name.clone())], Json(manifest)).into_response()
}

/// `GET /api/v1/data`: streams the items named by the manifest header as
/// server-sent events, one message per page of ids.
pub async fn data(State(ctx): State<Arc<ServerContext>>, headers: HeaderMap) -> Response {
    let Some(node) = header(&headers, NODE_HEADER).filter(|n| !n.is_empty()) else {
        return bad_request("missing node header");
    };
    let node = node.to_owned();
    let manifest: AssembleManifest = match header(&headers, MANIFEST_HEADER)
        .map(serde_json::from_str)
    {
        Some(Ok(manifest)) => manifest,
        Some(Err(error)) => return bad_request(format!("invalid manifest header: {error}")),
        None => return bad_request("missing manifest header"),
    };

    let uids: Vec<Suid> = manifest.iter().map(|id| manifest.get_uid(id)).collect();
    let page_size = ctx.config.page_size.max(1);

    let stream = async_stream::stream! {
        let mut encoder = EventStreamEncoder::new();
        let mut buf = BytesMut::new();

        // Prime the connection before the first page is assembled.
        encoder.ping(&mut buf);
        yield Ok::<Bytes, Infallible>(buf.split().freeze());

        let syncer = ctx.instance.syncer(&node);
        for page in uids.chunks(page_size) {
            let mut wanted = AssembleManifest::new();
            wanted.append_uids(page);
            let result = syncer
                .data(&wanted)
                .map_err(|error| error.to_string())
                .and_then(|items| {
                    serde_json::to_string(&items).map_err(|error| error.to_string())
                });
            match result {
                Ok(body) => {
                    if encoder.encode(Message::data(body), &mut buf).is_ok() {
                        yield Ok(buf.split().freeze());
                    }
                }
                Err(error) => {
                    error!(message = "Data page failed.", node = %syncer.name(), %error);
                    let _ = encoder.encode(Message::error(error), &mut buf);
                    yield Ok(buf.split().freeze());
                    break;
                }
            }
        }

        // Exactly one closing event, even after an error.
        let _ = encoder.encode(Message::eof(), &mut buf);
        yield Ok(buf.split().freeze());
    };

    (
        [
            (header::CONTENT_TYPE, CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        StreamBody::new(stream),
    )
        .into_response()
}
