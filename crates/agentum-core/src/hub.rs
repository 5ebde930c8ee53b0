//! Per-session event fan-out.
//!
//! One hub exists per running session. It is the single source of sequence
//! numbers, distributes every event (partials included) to an unbounded set
//! of live subscribers, and forwards the persistable subset to the
//! persistence writer on a dedicated channel so slow database writes never
//! block streaming.
//!
//! A subscriber may join with `after = N` to replay persisted history before
//! switching to the live stream. The switch is serialized with `publish` by
//! the hub lock: replay covers everything persisted before this run plus the
//! in-memory backlog of the current run, so no event can fall between replay
//! and attachment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::events::{EventBody, EventRecord};
use crate::store::{MetadataStore, StoreError};

#[derive(Error, Debug)]
pub enum HubError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<EventRecord>,
    lagged: Arc<AtomicBool>,
}

struct HubInner {
    next_sequence: u64,
    /// First sequence number assigned in this run. Persisted events below
    /// this belong to earlier runs and are replayed from the store.
    run_start_sequence: u64,
    /// Persistable events emitted during this run, kept for replay until the
    /// hub closes.
    backlog: Vec<EventRecord>,
    subscribers: Vec<Subscriber>,
    persist_tx: Option<mpsc::UnboundedSender<EventRecord>>,
    next_subscriber_id: u64,
    closed: bool,
}

/// Handle returned to a subscriber.
pub struct Subscription {
    pub subscriber_id: u64,
    /// Persisted prefix plus current-run backlog, already filtered by `after`.
    pub replay: Vec<EventRecord>,
    /// Live receiver; `None` when the stream had already closed.
    pub live: Option<mpsc::Receiver<EventRecord>>,
    /// Set when the hub dropped this subscriber for lagging; the stream layer
    /// turns it into a final `subscriber_lagged` error event.
    pub lagged: Arc<AtomicBool>,
}

/// Per-session pub/sub with monotonic sequence assignment.
pub struct EventHub {
    session_id: String,
    store: Arc<MetadataStore>,
    subscriber_buffer: usize,
    inner: Mutex<HubInner>,
}

impl EventHub {
    /// Create the hub for one run, seeding the sequence counter past the
    /// persisted history. Returns the hub and the persistence channel the
    /// writer consumes.
    pub async fn open(
        session_id: &str,
        store: Arc<MetadataStore>,
        subscriber_buffer: usize,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<EventRecord>), HubError> {
        let start = store.max_sequence(session_id).await? + 1;
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            session_id: session_id.to_string(),
            store,
            subscriber_buffer,
            inner: Mutex::new(HubInner {
                next_sequence: start,
                run_start_sequence: start,
                backlog: Vec::new(),
                subscribers: Vec::new(),
                persist_tx: Some(persist_tx),
                next_subscriber_id: 1,
                closed: false,
            }),
        });
        Ok((hub, persist_rx))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Assign a sequence number and fan the event out. Returns the sequenced
    /// record, or `None` when the stream has already closed.
    pub async fn publish(&self, body: EventBody) -> Option<EventRecord> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            log::warn!(
                "dropping {} for closed session {}",
                body.kind(),
                self.session_id
            );
            return None;
        }

        let terminal = body.is_terminal();
        let record = Self::sequence_event(&mut inner, body);
        let removed = Self::fan_out(&mut inner, &record);

        if terminal {
            Self::close(&mut inner);
        } else if removed > 0 {
            self.note_disconnects(&mut inner);
        }

        Some(record)
    }

    /// Join the stream. Replays persisted events with `sequence > after`,
    /// then hands over to the live channel without duplication or omission.
    pub async fn subscribe(&self, after: u64) -> Result<Subscription, HubError> {
        let mut inner = self.inner.lock().await;

        // Persisted prefix from earlier runs. The store read happens under
        // the hub lock, so no event can be assigned while we assemble the
        // replay snapshot.
        let run_start = inner.run_start_sequence;
        let mut replay: Vec<EventRecord> = self
            .store
            .list_events(&self.session_id, after)
            .await?
            .into_iter()
            .filter(|e| e.sequence < run_start)
            .collect();
        replay.extend(
            inner
                .backlog
                .iter()
                .filter(|e| e.sequence > after)
                .cloned(),
        );

        if inner.closed {
            return Ok(Subscription {
                subscriber_id: 0,
                replay,
                live: None,
                lagged: Arc::new(AtomicBool::new(false)),
            });
        }

        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let lagged = Arc::new(AtomicBool::new(false));
        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.push(Subscriber {
            id,
            tx,
            lagged: Arc::clone(&lagged),
        });

        let count = inner.subscribers.len() as u32;
        let connect = Self::sequence_event(
            &mut inner,
            EventBody::SessionConnect {
                subscriber_count: count,
            },
        );
        Self::fan_out(&mut inner, &connect);

        Ok(Subscription {
            subscriber_id: id,
            replay,
            live: Some(rx),
            lagged,
        })
    }

    /// Detach a subscriber (client disconnect). Safe to call after close.
    pub async fn unsubscribe(&self, subscriber_id: u64) {
        let mut inner = self.inner.lock().await;
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != subscriber_id);
        if inner.subscribers.len() < before && !inner.closed {
            self.note_disconnects(&mut inner);
        }
    }

    /// Current number of live subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    /// Whether a terminal event has been fanned out.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    fn sequence_event(inner: &mut HubInner, body: EventBody) -> EventRecord {
        let record = EventRecord::new(body, inner.next_sequence);
        inner.next_sequence += 1;

        if record.body.is_persistable() {
            inner.backlog.push(record.clone());
            if let Some(tx) = &inner.persist_tx {
                // Unbounded by design: the persistence queue is drained by a
                // dedicated writer and bounded by the run length.
                let _ = tx.send(record.clone());
            }
        }
        record
    }

    /// Deliver to every subscriber; drop the ones that lag or went away.
    /// Returns how many were removed for reasons other than lagging.
    fn fan_out(inner: &mut HubInner, record: &EventRecord) -> usize {
        let mut disconnected = 0;
        inner.subscribers.retain(|sub| {
            match sub.tx.try_send(record.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop it rather than stall the session.
                    sub.lagged.store(true, Ordering::SeqCst);
                    log::warn!("dropping lagged subscriber {}", sub.id);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    disconnected += 1;
                    false
                }
            }
        });
        disconnected
    }

    fn note_disconnects(&self, inner: &mut HubInner) {
        let count = inner.subscribers.len() as u32;
        let record = Self::sequence_event(
            inner,
            EventBody::SessionDisconnect {
                subscriber_count: count,
            },
        );
        Self::fan_out(inner, &record);
    }

    fn close(inner: &mut HubInner) {
        inner.closed = true;
        // Dropping the senders ends every subscriber stream and lets the
        // persistence writer drain and exit.
        inner.subscribers.clear();
        inner.persist_tx = None;
    }
}
