//! Event persistence writer.
//!
//! A single task per running session drains the hub's persistence channel
//! and commits events to the metadata store in order. The store already
//! retries transient failures with backoff; when an event still cannot be
//! written the run is poisoned — the writer emits a terminal persistence
//! error and asks the supervisor to abort.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBody, EventRecord};
use crate::hub::EventHub;
use crate::store::MetadataStore;

/// Spawn the writer task for one session.
///
/// The task exits when the channel closes (hub closed after the terminal
/// event) or on permanent persistence failure.
pub fn spawn(
    store: Arc<MetadataStore>,
    hub: Arc<EventHub>,
    mut rx: mpsc::UnboundedReceiver<EventRecord>,
    abort: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let session_id = hub.session_id().to_string();
        while let Some(record) = rx.recv().await {
            if let Err(e) = store.record_event(&session_id, &record).await {
                log::error!(
                    "persistence failed for session {session_id} seq {}: {e}",
                    record.sequence
                );
                // Surface the failure on the stream, then stop the run. The
                // error event itself cannot be persisted any more; it still
                // reaches live subscribers and closes their streams.
                hub.publish(EventBody::Error {
                    message: format!("event persistence failed: {e}"),
                    error_type: "persistence".to_string(),
                })
                .await;
                abort.cancel();
                return;
            }
        }
        log::debug!("persistence writer for session {session_id} drained");
    })
}
