//! The edge-side poll/apply loop.

use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use outpost_sync::storage::{SledStorage, Storage};
use outpost_sync::{Instance, Item};

use crate::config::AgentConfig;
use crate::event::{Envelope, EventKind};
use crate::kubernetes::MetaKey;

mod client;

pub use client::{Client, ClientError};

/// Storage space holding the agent's local mirror of applied resources.
const OBJECTS_SPACE: &str = "objects";

#[derive(Debug, Snafu)]
pub enum AgentError {
    #[snafu(display("failed to open storage: {source}"))]
    OpenStorage { source: outpost_sync::storage::Error },

    #[snafu(display("request manifest failed: {source}"))]
    FetchManifest { source: ClientError },

    #[snafu(display("stream data failed: {source}"))]
    FetchData { source: ClientError },

    #[snafu(display("sync failed: {source}"))]
    Sync { source: outpost_sync::Error },
}

impl AgentError {
    /// A replay mismatch is the signal to re-pull immediately: the stream
    /// delivered a page whose successors are not staged yet.
    pub fn is_data_not_match(&self) -> bool {
        fn inner(error: &outpost_sync::Error) -> bool {
            matches!(error, outpost_sync::Error::DataNotMatch)
        }
        match self {
            AgentError::Sync { source } => inner(source),
            AgentError::FetchData {
                source: ClientError::Handle { source },
            } => source
                .downcast_ref::<outpost_sync::Error>()
                .is_some_and(inner),
            _ => false,
        }
    }
}

/// Runs the agent until the token cancels.
pub async fn run(config: AgentConfig, token: CancellationToken) -> Result<(), AgentError> {
    let storage: Arc<dyn Storage> =
        Arc::new(SledStorage::open(&config.storage).context(OpenStorageSnafu)?);
    let instance = Instance::new(config.agent_name(), Arc::clone(&storage));
    let mut client = Client::new(&config.server, config.agent_name());

    loop {
        // Cancellation tears down an in-flight stream, not just the loop.
        let result = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            result = sync_once(&instance, &mut client, Arc::clone(&storage)) => result,
        };
        match result {
            Err(error) if error.is_data_not_match() => {
                // A partial batch; the next pull picks up the missing head.
                debug!(message = "Replay out of step, pulling again.");
                continue;
            }
            Ok(()) => {
                debug!(message = "Sync finished, waiting for the next poll.");
            }
            Err(error) => {
                error!(message = "Sync failed.", %error);
            }
        }
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(config.poll_interval()) => {}
        }
    }
}

/// One pull: manifest page, data stream, ordered replay into local state.
pub async fn sync_once(
    instance: &Instance,
    client: &mut Client,
    storage: Arc<dyn Storage>,
) -> Result<(), AgentError> {
    let data_set = instance.data_set();
    let state = data_set.state();

    let manifest = client
        .manifest(&state)
        .await
        .context(FetchManifestSnafu)?;
    if manifest.is_empty() {
        return Ok(());
    }
    data_set.sync_manifest(&manifest);

    client
        .data(&manifest, |message| {
            let items: Vec<Item> = serde_json::from_str(&message.data)?;
            let result = data_set.sync_and_delete(&items, &mut |item| {
                apply(storage.as_ref(), item)
            });
            // Box the sync error so the outer loop can recognize a replay
            // mismatch through the client.
            result.map_err(|error| Box::new(error) as Box<dyn std::error::Error + Send + Sync>)
        })
        .await
        .context(FetchDataSnafu)
}

/// Default apply callback: mirror the resource into the local objects
/// space, keyed by its logical identity.
fn apply(storage: &dyn Storage, item: &Item) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let envelope: Envelope = serde_json::from_slice(&item.value)?;
    let Some(tag) = item.uid.custom() else {
        return Ok(());
    };
    let meta = MetaKey::parse(tag)?;
    let key = meta.logical_key();

    debug!(
        message = "Applying event.",
        kind = ?envelope.kind,
        resource = %key,
        resource_version = %meta.resource_version,
    );
    match envelope.kind {
        EventKind::Added | EventKind::Modified => {
            storage.put(OBJECTS_SPACE, key.as_bytes(), envelope.data.get().as_bytes())?;
        }
        EventKind::Deleted => {
            storage.delete(OBJECTS_SPACE, key.as_bytes())?;
        }
    }
    Ok(())
}
