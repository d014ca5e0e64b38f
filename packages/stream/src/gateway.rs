// ABOUTME: Per-session broadcast channels with ordered delivery and heartbeats
// ABOUTME: Connections attach to a session, receive every published event in order, then detach

use crate::events::{EventPayload, StreamEvent, LAGGED_ERROR_CODE};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Sequencer {
    /// `None` once the session's stream is closed
    sender: Option<broadcast::Sender<StreamEvent>>,
    next: u64,
}

struct Attachments {
    connections: usize,
    heartbeat: Option<JoinHandle<()>>,
}

type ChannelMap = RwLock<HashMap<String, Arc<SessionChannel>>>;

/// The single ordered queue of one session
///
/// Exists only while at least one connection is attached.
struct SessionChannel {
    session_id: String,
    sequencer: Mutex<Sequencer>,
    attachments: Mutex<Attachments>,
}

impl SessionChannel {
    fn new(session_id: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            session_id: session_id.to_string(),
            sequencer: Mutex::new(Sequencer {
                sender: Some(sender),
                next: 1,
            }),
            attachments: Mutex::new(Attachments {
                connections: 0,
                heartbeat: None,
            }),
        }
    }

    fn sequencer(&self) -> MutexGuard<'_, Sequencer> {
        self.sequencer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn attachments(&self) -> MutexGuard<'_, Attachments> {
        self.attachments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number the event and send it; both happen under one lock
    fn publish(&self, payload: EventPayload) -> u64 {
        let mut sequencer = self.sequencer();
        let sequence = sequencer.next;
        sequencer.next += 1;

        let event = StreamEvent {
            session_id: self.session_id.clone(),
            sequence: Some(sequence),
            timestamp: Utc::now(),
            payload,
        };
        if let Some(sender) = &sequencer.sender {
            // No receivers is the normal case when nobody is watching
            let _ = sender.send(event);
        }
        sequence
    }

    fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        match &self.sequencer().sender {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn close(&self) {
        self.sequencer().sender = None;
        if let Some(heartbeat) = self.attachments().heartbeat.take() {
            heartbeat.abort();
        }
    }
}

/// A client's view of one session's event stream
pub struct Connection {
    id: u64,
    session_id: String,
    receiver: broadcast::Receiver<StreamEvent>,
    channel: Arc<SessionChannel>,
    channels: Arc<ChannelMap>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event in publish order
    ///
    /// A connection that fell behind gets a `lagged` error event and then
    /// continues from the oldest event still buffered. Returns `None` once
    /// the session's channel is closed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    session_id = %self.session_id,
                    connection_id = self.id,
                    "Stream connection lagged, {} events dropped", skipped
                );
                Some(StreamEvent::direct(
                    self.session_id.clone(),
                    EventPayload::error(
                        LAGGED_ERROR_CODE,
                        format!("{} events were dropped", skipped),
                    ),
                ))
            }
            Err(RecvError::Closed) => None,
        }
    }
}

impl Connection {
    /// Forget the session's channel once its last connection is gone
    fn release_channel(&self) {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // An attach may have raced in; the count is re-read under the map lock
        let unused = channels.get(&self.session_id).is_some_and(|current| {
            Arc::ptr_eq(current, &self.channel) && current.attachments().connections == 0
        });
        if unused {
            channels.remove(&self.session_id);
            debug!(session_id = %self.session_id, "Stream channel released");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let remaining = {
            let mut attachments = self.channel.attachments();
            attachments.connections = attachments.connections.saturating_sub(1);
            if attachments.connections == 0 {
                if let Some(heartbeat) = attachments.heartbeat.take() {
                    heartbeat.abort();
                }
            }
            attachments.connections
        };
        debug!(
            session_id = %self.session_id,
            connection_id = self.id,
            remaining,
            "Stream connection detached"
        );
        if remaining == 0 {
            self.release_channel();
        }
    }
}

pub struct StreamGateway {
    channels: Arc<ChannelMap>,
    capacity: usize,
    heartbeat_interval: Duration,
    next_connection_id: AtomicU64,
}

impl StreamGateway {
    pub fn new(capacity: usize, heartbeat_interval: Duration) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            heartbeat_interval,
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Open a connection that receives every event published from now on
    pub fn attach(&self, session_id: &str) -> Connection {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        // Lock order: channel map, then the channel's own locks
        let (channel, receiver) = {
            let mut channels = self
                .channels
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let channel = Arc::clone(
                channels
                    .entry(session_id.to_string())
                    .or_insert_with(|| Arc::new(SessionChannel::new(session_id, self.capacity))),
            );
            let receiver = channel.subscribe();

            let mut attachments = channel.attachments();
            attachments.connections += 1;
            if attachments.heartbeat.is_none() {
                attachments.heartbeat = Some(self.spawn_heartbeat(Arc::clone(&channel)));
            }
            debug!(
                session_id = %session_id,
                connection_id = id,
                connections = attachments.connections,
                "Stream connection attached"
            );
            drop(attachments);
            (channel, receiver)
        };

        Connection {
            id,
            session_id: session_id.to_string(),
            receiver,
            channel,
            channels: Arc::clone(&self.channels),
        }
    }

    fn spawn_heartbeat(&self, channel: Arc<SessionChannel>) -> JoinHandle<()> {
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                channel.publish(EventPayload::Heartbeat);
            }
        })
    }

    /// Send an event to every connection of the session, in publish order
    ///
    /// Returns the event's sequence number, or `None` when nobody is attached
    /// and the event was dropped.
    pub fn publish(&self, session_id: &str, payload: EventPayload) -> Option<u64> {
        let channel = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .cloned()?;
        let kind = payload.kind();
        let sequence = channel.publish(payload);
        debug!(session_id = %session_id, sequence, kind, "Published stream event");
        Some(sequence)
    }

    pub fn detach(&self, connection: Connection) {
        drop(connection);
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(session_id)
            .map(|channel| channel.attachments().connections)
            .unwrap_or(0)
    }

    /// Drop the session's channel; attached connections see the end of the stream
    pub fn close_session(&self, session_id: &str) {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id);
        if let Some(channel) = removed {
            channel.close();
            info!(session_id = %session_id, "Stream channel closed");
        }
    }
}
