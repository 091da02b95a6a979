//! Event routing and delivery bookkeeping for the MQTT link
//!
//! Routing decisions are pure functions over rumqttc events; the ack
//! registry and command forwarder are the small pieces of shared state the
//! link supervisor updates as events arrive.

use rumqttc::{Event, Incoming};
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Broker accepted the session; safe to subscribe and publish
    ConnectionAcknowledged { session_present: bool },
    /// Message received on a subscribed topic
    CommandReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker acknowledged one of our QoS 1 publishes
    PublishAcknowledged { packet_id: u16 },
    /// Broker closed the session
    Disconnected,
    /// Keep-alive and other protocol chatter
    InfrastructureEvent(String),
    /// Outgoing packet echo (handled by rumqttc)
    OutgoingEvent,
}

/// Pure routing of rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    /// Map one event loop notification onto a route (pure function)
    pub fn route_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Incoming::ConnAck(ack)) => EventRoute::ConnectionAcknowledged {
                session_present: ack.session_present,
            },
            Event::Incoming(Incoming::Publish(publish)) => EventRoute::CommandReceived {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
                retain: publish.retain,
            },
            Event::Incoming(Incoming::PubAck(ack)) => EventRoute::PublishAcknowledged {
                packet_id: ack.pkid,
            },
            Event::Incoming(Incoming::Disconnect) => EventRoute::Disconnected,
            Event::Incoming(other) => EventRoute::InfrastructureEvent(format!("{other:?}")),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Decide whether an inbound publish is a live command (pure function)
    ///
    /// Retained messages are skipped so a stale command parked on the topic
    /// is not replayed on every session resume.
    pub fn should_forward_command(topic: &str, retain: bool, expected_topic: &str) -> bool {
        if retain {
            debug!(topic, "ignoring retained message");
            return false;
        }
        if topic != expected_topic {
            debug!(topic, expected_topic, "ignoring message on unexpected topic");
            return false;
        }
        true
    }
}

/// In-flight QoS 1 publish bookkeeping
///
/// The broker acknowledges QoS 1 publishes in the order they were sent, so
/// completing waiters first-in-first-out pairs every PubAck with the oldest
/// outstanding publish. A waiter whose caller timed out stays queued; its
/// eventual acknowledgment pops the stale sender and the completion is
/// simply discarded, keeping the pairing aligned.
pub struct AckRegistry {
    waiters: Mutex<VecDeque<oneshot::Sender<Result<(), String>>>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a waiter for the next unclaimed acknowledgment.
    pub async fn register(&self) -> oneshot::Receiver<Result<(), String>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.push_back(tx);
        rx
    }

    /// Complete the oldest waiter. Returns false when none was queued,
    /// which happens for acknowledgments of republished session traffic.
    pub async fn complete_next(&self) -> bool {
        match self.waiters.lock().await.pop_front() {
            Some(waiter) => {
                // Send fails if the publish already timed out; that is fine.
                let _ = waiter.send(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding waiter, used when the connection drops before
    /// their acknowledgments could arrive.
    pub async fn fail_all(&self, reason: &str) -> usize {
        let mut waiters = self.waiters.lock().await;
        let failed = waiters.len();
        for waiter in waiters.drain(..) {
            let _ = waiter.send(Err(reason.to_string()));
        }
        failed
    }

    /// Number of publishes still waiting for their acknowledgment.
    pub async fn pending(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

impl Default for AckRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Hands inbound command payloads to the router task (impure I/O)
pub struct CommandForwarder {
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl CommandForwarder {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
        }
    }

    pub async fn set_sender(&self, sender: mpsc::Sender<Vec<u8>>) {
        *self.sender.lock().await = Some(sender);
    }

    /// Forward one raw command payload without blocking the event loop on
    /// whatever the router does with it.
    pub async fn forward(&self, payload: Vec<u8>) -> Result<(), String> {
        let sender = self.sender.lock().await.clone();
        match sender {
            Some(sender) => sender
                .send(payload)
                .await
                .map_err(|e| format!("command channel closed: {e}")),
            None => {
                warn!("command received but no handler configured - payload dropped");
                Err("no command sender configured".to_string())
            }
        }
    }
}

impl Default for CommandForwarder {
    fn default() -> Self {
        Self::new()
    }
}
