//! Live event streaming over Server-Sent Events.
//!
//! `GET /api/v1/sessions/{id}/events?after=N` replays the persisted events
//! with `sequence > N`, then switches to the live stream without duplication
//! or omission. Each event goes out as
//!
//! ```text
//! id: <sequence>
//! data: <json record on one line>
//! ```
//!
//! and an idle connection receives `: heartbeat` comments. Terminal events
//! close the stream. A subscriber that falls too far behind is disconnected
//! with a final `subscriber_lagged` error event.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::Extension;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use agentum_core::hub::EventHub;
use agentum_core::{EventBody, EventRecord};

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::routes::owned_session;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub after: u64,
}

type SseItem = Result<Event, Infallible>;

/// GET /api/v1/sessions/{id}/events
pub async fn events_stream(
    State(state): State<SharedState>,
    Extension(user): Extension<CurrentUser>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<KeepAliveStream<Pin<Box<dyn Stream<Item = SseItem> + Send>>>>, ApiError> {
    let session = owned_session(&state, &session_id, &user).await?;
    let heartbeat = Duration::from_secs(state.ctx.config.runtime.heartbeat_interval_seconds);

    let stream: Pin<Box<dyn Stream<Item = SseItem> + Send>> = match state.ctx.hub(&session.id) {
        Some(hub) => {
            let sub = hub
                .subscribe(query.after)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            let replay = stream::iter(sub.replay.into_iter().map(to_sse_item));
            match sub.live {
                Some(rx) => {
                    let live = LiveStream {
                        rx: ReceiverStream::new(rx),
                        lagged: sub.lagged,
                        guard: Some(UnsubscribeGuard {
                            hub,
                            subscriber_id: sub.subscriber_id,
                        }),
                        last_sequence: query.after,
                        done: false,
                    };
                    Box::pin(replay.chain(live))
                }
                // The run ended between lookup and subscribe; the replay
                // already contains the terminal event.
                None => Box::pin(replay),
            }
        }
        // No live run: serve the persisted history and close.
        None => {
            let events = state.ctx.store.list_events(&session.id, query.after).await?;
            Box::pin(stream::iter(events.into_iter().map(to_sse_item)))
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(heartbeat)
            .text("heartbeat"),
    ))
}

fn to_sse_item(record: EventRecord) -> SseItem {
    Ok(to_sse_event(&record))
}

fn to_sse_event(record: &EventRecord) -> Event {
    let event = Event::default().id(record.sequence.to_string());
    match serde_json::to_string(record) {
        Ok(json) => event.data(json),
        Err(e) => {
            log::error!("failed to serialize event {}: {e}", record.sequence);
            event.data("{}")
        }
    }
}

/// Detaches the subscriber from the hub when the client goes away.
struct UnsubscribeGuard {
    hub: Arc<EventHub>,
    subscriber_id: u64,
}

impl Drop for UnsubscribeGuard {
    fn drop(&mut self) {
        let hub = Arc::clone(&self.hub);
        let subscriber_id = self.subscriber_id;
        tokio::spawn(async move {
            hub.unsubscribe(subscriber_id).await;
        });
    }
}

/// Live portion of the SSE stream.
///
/// Forwards hub events until the channel closes, then — when the hub dropped
/// this subscriber for lagging — appends one final `subscriber_lagged` error
/// event so the client knows its view is incomplete.
struct LiveStream {
    rx: ReceiverStream<EventRecord>,
    lagged: Arc<AtomicBool>,
    guard: Option<UnsubscribeGuard>,
    last_sequence: u64,
    done: bool,
}

impl Stream for LiveStream {
    type Item = SseItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_next_unpin(cx) {
            Poll::Ready(Some(record)) => {
                self.last_sequence = record.sequence;
                Poll::Ready(Some(to_sse_item(record)))
            }
            Poll::Ready(None) => {
                self.done = true;
                self.guard.take();
                if self.lagged.load(Ordering::SeqCst) {
                    let record = EventRecord::new(
                        EventBody::Error {
                            message: "subscriber lagged behind the event stream".to_string(),
                            error_type: "subscriber_lagged".to_string(),
                        },
                        self.last_sequence + 1,
                    );
                    Poll::Ready(Some(Ok(to_sse_event(&record))))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
