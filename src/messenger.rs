//! Point-to-point messaging over explicit paths
//!
//! Messages ride the path vector and name a registered handler on the
//! receiving instance. A request carries the return path back to its
//! sender; the response travels that path with the same correlation id.
//! Unanswered requests are retried a bounded number of times at a fixed
//! interval before failing.

use crate::address::Address;
use crate::api::config::FabricConfig;
use crate::api::events::Event;
use crate::error::{Error, Result};
use crate::protocol::{HandlerKind, MessageKind, MessagePacket, Neighborhood};
use crate::routing::{PathHandler, PathVector, Router};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{trace, warn};
use uuid::Uuid;

/// A named message handler.
///
/// Returning `Some` sends the value back as the response when the request
/// carried a return path.
pub type MessageHandler = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync + 'static>;

/// The messenger protocol for one instance
pub struct Messenger {
    router: Router,
    path_vector: Arc<PathVector>,
    config: Arc<FabricConfig>,
    handlers: DashMap<String, MessageHandler>,
    pending: DashMap<Uuid, oneshot::Sender<Value>>,
}

impl Messenger {
    /// Create the messenger over `path_vector`
    pub fn new(router: Router, path_vector: Arc<PathVector>, config: Arc<FabricConfig>) -> Arc<Self> {
        Arc::new(Self {
            router,
            path_vector,
            config,
            handlers: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    /// Register the handler invoked for messages named `name`
    pub fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Remove the handler for `name`
    pub fn unregister(&self, name: &str) {
        self.handlers.remove(name);
    }

    /// Send a message along `path` without expecting a response
    pub fn send_message(&self, path: &Address, name: &str, body: Value) -> Result<()> {
        let packet = MessagePacket {
            id: Uuid::new_v4(),
            kind: MessageKind::Request,
            name: Some(name.to_string()),
            from: None,
            m: body,
        };
        self.path_vector
            .send(path, HandlerKind::Messenger, serde_json::to_value(&packet)?)
    }

    /// Send a request along `path` and await its response.
    ///
    /// The request is re-sent at the configured interval until a response
    /// arrives or the attempts are exhausted.
    pub async fn request(&self, path: &Address, name: &str, body: Value) -> Result<Value> {
        let id = Uuid::new_v4();
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let packet = MessagePacket {
            id,
            kind: MessageKind::Request,
            name: Some(name.to_string()),
            from: Some(path.return_hops(self.router.local_id())),
            m: body,
        };
        let wire = serde_json::to_value(&packet)?;

        let mut attempts = 0;
        loop {
            if let Err(e) = self
                .path_vector
                .send(path, HandlerKind::Messenger, wire.clone())
            {
                trace!(%id, error = %e, "request send attempt failed");
            }
            attempts += 1;

            tokio::select! {
                response = &mut rx => {
                    return response
                        .map_err(|_| Error::Message("request cancelled".into()));
                }
                _ = tokio::time::sleep(self.config.request_retry_period) => {
                    if attempts >= self.config.request_retry_attempts {
                        self.pending.remove(&id);
                        let reason = format!(
                            "no response after {attempts} attempts"
                        );
                        self.router.events().dispatch(Event::MessageError {
                            id,
                            reason: reason.clone(),
                        });
                        return Err(Error::Message(reason));
                    }
                    trace!(%id, attempts, "retrying request");
                }
            }
        }
    }

    fn handle_request(&self, packet: MessagePacket) {
        let Some(name) = packet.name.as_deref() else {
            warn!(id = %packet.id, "request without handler name dropped");
            return;
        };
        let Some(handler) = self.handlers.get(name).map(|h| Arc::clone(h.value())) else {
            warn!(id = %packet.id, name, "no handler registered for message");
            self.router.events().dispatch(Event::MessageError {
                id: packet.id,
                reason: format!("no handler named {name:?}"),
            });
            return;
        };

        let response = handler(packet.m);
        let (Some(response), Some(from)) = (response, packet.from) else {
            return;
        };
        let reply = MessagePacket {
            id: packet.id,
            kind: MessageKind::Response,
            name: None,
            from: None,
            m: response,
        };
        let back = Address::new(from);
        let wire = match serde_json::to_value(&reply) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(id = %reply.id, error = %e, "response serialization failed");
                return;
            }
        };
        if let Err(e) = self.path_vector.send(&back, HandlerKind::Messenger, wire) {
            warn!(id = %reply.id, error = %e, "response could not be sent");
        }
    }

    fn handle_response(&self, packet: MessagePacket) {
        match self.pending.remove(&packet.id) {
            Some((_, waiter)) => {
                let _ = waiter.send(packet.m);
            }
            // Late duplicate after a retry already resolved it.
            None => trace!(id = %packet.id, "response without pending request"),
        }
    }
}

impl PathHandler for Messenger {
    fn handle(&self, _level: Neighborhood, payload: Value) {
        let packet: MessagePacket = match serde_json::from_value(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "malformed message packet dropped");
                return;
            }
        };
        match packet.kind {
            MessageKind::Request => self.handle_request(packet),
            MessageKind::Response => self.handle_response(packet),
        }
    }
}
