//! The delivery engine: live push to online recipients, durable queuing for
//! offline ones, and backlog replay on reconnect.
//!
//! Every message is persisted before any push is attempted, so a failed
//! push never loses a message the engine accepted: it stays queued with
//! `delivered = 0` and comes back on the recipient's next registration.  The
//! `delivered` flag is only claimed after the durable append succeeded and
//! the push was handed to a live connection; the sender echo never touches
//! it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::logging;
use crate::presence::{PresenceRegistry, PushSender};
use crate::protocol::ServerEvent;
use crate::storage::{MessageRow, Storage, StorageError};

/// Storage shared between the delivery engine and the REST surface.
pub type SharedStorage = Arc<Mutex<Storage>>;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct DeliveryEngine {
    storage: SharedStorage,
    registry: Arc<PresenceRegistry>,
}

impl DeliveryEngine {
    pub fn new(storage: SharedStorage, registry: Arc<PresenceRegistry>) -> Self {
        Self { storage, registry }
    }

    /// Accept a message for delivery.
    ///
    /// Returns `Ok(None)` for a malformed send (empty sender, recipient, or
    /// text), which is dropped without side effects.  Otherwise the message
    /// is persisted with a server-assigned timestamp, pushed to the
    /// recipient if they are online, and echoed to the sender's own
    /// connection if that is online.  The returned row reflects the durable
    /// state: `delivered` is true only when the live push succeeded *and*
    /// the store recorded it.
    pub async fn send(
        &self,
        from: &str,
        to: &str,
        text: &str,
    ) -> Result<Option<MessageRow>, StorageError> {
        if from.is_empty() || to.is_empty() || text.is_empty() {
            return Ok(None);
        }

        let timestamp = now_millis();
        let id = {
            let storage = self.storage.lock().await;
            storage.append_message(from, to, text, timestamp)?
        };

        let mut row = MessageRow {
            id,
            sender: from.to_string(),
            recipient: to.to_string(),
            body: text.to_string(),
            timestamp,
            delivered: false,
        };

        if let Some(push) = self.registry.push_target(to) {
            let event = ServerEvent::Message {
                from: from.to_string(),
                to: to.to_string(),
                text: text.to_string(),
                timestamp,
            };
            // A closed channel means the connection died since the lookup:
            // treat the recipient as offline and leave the message queued.
            if push.send(event).is_ok() {
                let marked = {
                    let storage = self.storage.lock().await;
                    storage.mark_delivered(id)
                };
                match marked {
                    Ok(_) => row.delivered = true,
                    Err(e) => {
                        // The recipient saw the message but the store still
                        // has it pending; a later replay may repeat it.
                        crate::hlog!(
                            "message {id} pushed to {} but not recorded as delivered: {e}",
                            logging::ident(to)
                        );
                    }
                }
            }
        }

        // Echo to the sender's own connection, best-effort. Never marks the
        // message delivered and never fails the send.
        if let Some(push) = self.registry.push_target(from) {
            let _ = push.send(ServerEvent::Message {
                from: from.to_string(),
                to: to.to_string(),
                text: text.to_string(),
                timestamp,
            });
        }

        crate::hlog!(
            "message {} -> {} ({})",
            logging::ident(from),
            logging::ident(to),
            if row.delivered { "delivered" } else { "queued" }
        );

        Ok(Some(row))
    }

    /// Replay the backlog for a freshly registered identity.
    ///
    /// Pushes every pending message, oldest first, marking each delivered
    /// before advancing to the next.  A failed push means the connection is
    /// already gone; the pass stops and the remainder stays queued for the
    /// next registration.  Returns how many messages were delivered.
    pub async fn replay(&self, identity: &str, push: &PushSender) -> Result<usize, StorageError> {
        let pending = {
            let storage = self.storage.lock().await;
            storage.undelivered_for(identity)?
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let mut delivered = 0usize;
        for msg in pending {
            let event = ServerEvent::Message {
                from: msg.sender,
                to: msg.recipient,
                text: msg.body,
                timestamp: msg.timestamp,
            };
            if push.send(event).is_err() {
                break;
            }
            {
                let storage = self.storage.lock().await;
                storage.mark_delivered(msg.id)?;
            }
            delivered += 1;
        }

        crate::hlog!(
            "replay: delivered {delivered} queued message(s) to {}",
            logging::ident(identity)
        );
        Ok(delivered)
    }

    /// Forward a transient typing indicator. No persistence, no echo; a
    /// malformed or offline-recipient indicator is silently dropped.
    pub fn typing(&self, from: &str, to: &str) {
        if from.is_empty() || to.is_empty() {
            return;
        }
        if let Some(push) = self.registry.push_target(to) {
            let _ = push.send(ServerEvent::Typing {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }
}
