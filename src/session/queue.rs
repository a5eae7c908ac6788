use std::collections::VecDeque;

use super::types::request::OutboundMessage;
use crate::ws::traits::Socket;

/// What happened to a message handed to [`MessageQueueManager::send`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the socket
    Sent,
    /// Held for the next flush
    Queued {
        /// Whether the oldest queued message was discarded to make room
        evicted: bool,
    },
    /// Discarded: a heartbeat that could not go out now
    Dropped,
}

/// Bounded FIFO of outbound messages waiting for the session to become sendable.
///
/// At capacity the *oldest* entry is evicted, never the newest.
#[derive(Debug)]
pub struct MessageQueueManager {
    queue: VecDeque<OutboundMessage>,
    capacity: usize,
}

impl MessageQueueManager {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queued messages, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &OutboundMessage> {
        self.queue.iter()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Send `message` now if allowed, otherwise hold it.
    ///
    /// `authenticate` frames skip the `can_send_now` gate. Heartbeats that cannot go out are
    /// dropped instead of queued.
    pub fn send<S, F>(
        &mut self,
        message: OutboundMessage,
        socket: Option<&S>,
        can_send_now: F,
    ) -> SendOutcome
    where
        S: Socket,
        F: Fn() -> bool,
    {
        if message.is_authenticate() || can_send_now() {
            return self.transmit(message, socket);
        }

        if message.is_heartbeat() {
            #[cfg(feature = "tracing")]
            tracing::trace!("Dropping heartbeat while the session cannot send");
            return SendOutcome::Dropped;
        }

        self.enqueue(message)
    }

    /// Drain the queue in FIFO order while `can_send_now` holds.
    ///
    /// The gate is re-checked before every message. A message whose send fails goes back to
    /// the front and draining stops. Returns the number of messages sent.
    pub fn flush<S, F>(&mut self, socket: Option<&S>, can_send_now: F) -> usize
    where
        S: Socket,
        F: Fn() -> bool,
    {
        let mut sent = 0_usize;

        while !self.queue.is_empty() && can_send_now() {
            let Some(socket) = socket.filter(|s| s.ready_state().is_open()) else {
                break;
            };
            let Some(message) = self.queue.pop_front() else {
                break;
            };

            match message.to_json() {
                Ok(json) => {
                    if let Err(e) = socket.send_text(json) {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            error = %e,
                            tag = message.tag(),
                            "Flush interrupted, re-queueing"
                        );
                        #[cfg(not(feature = "tracing"))]
                        let _ = &e;

                        self.queue.push_front(message);
                        break;
                    }
                    sent = sent.saturating_add(1);
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        error = %e,
                        tag = message.tag(),
                        "Discarding unserializable message"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }

        #[cfg(feature = "tracing")]
        if sent > 0 {
            tracing::debug!(sent, remaining = self.queue.len(), "Flushed outbound queue");
        }

        sent
    }

    /// Raw send. A socket that is not open gets the message re-queued.
    fn transmit<S: Socket>(&mut self, message: OutboundMessage, socket: Option<&S>) -> SendOutcome {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    error = %e,
                    tag = message.tag(),
                    "Discarding unserializable message"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return SendOutcome::Dropped;
            }
        };

        let result = match socket {
            Some(socket) if socket.ready_state().is_open() => socket.send_text(json),
            _ => Err(crate::ws::WsError::NotOpen.into()),
        };

        match result {
            Ok(()) => SendOutcome::Sent,
            Err(_) if message.is_heartbeat() => SendOutcome::Dropped,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, tag = message.tag(), "Send failed, re-queueing");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                self.enqueue(message)
            }
        }
    }

    fn enqueue(&mut self, message: OutboundMessage) -> SendOutcome {
        let evicted = self.queue.len() >= self.capacity;
        if evicted {
            let _oldest = self.queue.pop_front();

            #[cfg(feature = "tracing")]
            tracing::warn!(
                capacity = self.capacity,
                evicted = _oldest.as_ref().map(OutboundMessage::tag),
                "Outbound queue full, dropped oldest message"
            );
        }

        self.queue.push_back(message);
        SendOutcome::Queued { evicted }
    }
}
