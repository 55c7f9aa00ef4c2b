//! Stream multiplexing with transitive back-pressure
//!
//! Any number of streams share the fabric between two endpoints. Each
//! stream is announced with a `new` control frame carrying the return path,
//! then carries data frames until either side closes with `end`. A close
//! after the peer's `end` was received stays local; the `end` frame is
//! never echoed back.
//!
//! Back-pressure is edge-triggered: when a receiver's consumer buffer
//! fills, it sends `pause` once and keeps buffering; the sender's writes
//! block until `resume` arrives after the consumer drains. A slow final
//! consumer therefore stalls the original producer across any number of
//! hops.

use crate::address::{Address, VertexId};
use crate::api::config::FabricConfig;
use crate::api::events::{Event, EventHandlers};
use crate::error::{Error, Result};
use crate::protocol::{HandlerKind, MuxControl, MuxFrame, MuxOp, MuxPayload, Neighborhood, StreamKind};
use crate::routing::{PathHandler, PathVector};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, trace, warn};
use uuid::Uuid;

enum PumpMsg {
    Data(Value),
    End,
}

struct StreamEntry {
    id: Uuid,
    /// Whether this side allocated the id (the wire `local` flag)
    local_origin: bool,
    remote: Address,
    meta: Option<Value>,
    kind: StreamKind,
    intake: mpsc::UnboundedSender<PumpMsg>,
    /// Peer asked us to stop sending
    peer_paused: AtomicBool,
    resume_gate: Notify,
    /// We asked the peer to stop sending
    sent_pause: AtomicBool,
    sent_end: AtomicBool,
    received_end: AtomicBool,
}

struct MuxInner {
    local: VertexId,
    path_vector: Arc<PathVector>,
    events: EventHandlers,
    config: Arc<FabricConfig>,
    streams: DashMap<(Uuid, bool), Arc<StreamEntry>>,
    accepts_tx: mpsc::UnboundedSender<MuxStream>,
    accepts_rx: Mutex<mpsc::UnboundedReceiver<MuxStream>>,
}

impl MuxInner {
    fn send_frame(&self, entry: &StreamEntry, payload: MuxPayload) -> Result<()> {
        let frame = MuxFrame {
            id: entry.id,
            local: entry.local_origin,
            m: payload,
        };
        self.path_vector.send(
            &entry.remote,
            HandlerKind::Streamer,
            serde_json::to_value(&frame)?,
        )
    }

    fn control(&self, entry: &StreamEntry, op: MuxOp) -> Result<()> {
        self.send_frame(
            entry,
            MuxPayload::Control(MuxControl {
                p: op,
                meta: None,
                mode: None,
                from: None,
            }),
        )
    }

    /// Drop the entry from the arena; late frames for it are discarded
    fn retire(&self, entry: &StreamEntry) {
        if self.streams.remove(&(entry.id, entry.local_origin)).is_some() {
            debug!(id = %entry.id, "stream retired");
        }
    }
}

/// The stream multiplexer for one instance
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl Multiplexer {
    /// Create the multiplexer over `path_vector`
    pub fn new(
        local: VertexId,
        path_vector: Arc<PathVector>,
        events: EventHandlers,
        config: Arc<FabricConfig>,
    ) -> Arc<Self> {
        let (accepts_tx, accepts_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inner: Arc::new(MuxInner {
                local,
                path_vector,
                events,
                config,
                streams: DashMap::new(),
                accepts_tx,
                accepts_rx: Mutex::new(accepts_rx),
            }),
        })
    }

    /// Open a stream along `path`.
    ///
    /// The announcement is sent ahead; data may follow immediately without
    /// waiting for the far side to accept.
    pub fn create_stream(
        &self,
        path: &Address,
        meta: Option<Value>,
        kind: StreamKind,
    ) -> Result<MuxStream> {
        let id = Uuid::new_v4();
        let stream = self.install(id, true, path.clone(), meta.clone(), kind);
        self.inner.send_frame(
            &stream.entry,
            MuxPayload::Control(MuxControl {
                p: MuxOp::New,
                meta,
                mode: Some(kind),
                from: Some(path.return_hops(self.inner.local)),
            }),
        )?;
        Ok(stream)
    }

    /// Await the next stream opened by a remote peer
    pub async fn accept(&self) -> Option<MuxStream> {
        self.inner.accepts_rx.lock().await.recv().await
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        self.inner.streams.len()
    }

    /// Whether no streams are live
    pub fn is_empty(&self) -> bool {
        self.inner.streams.is_empty()
    }

    /// Force-close a stream without the orderly end exchange.
    ///
    /// Used when the path under the stream is gone for good.
    pub fn abort(&self, id: Uuid, reason: &str) {
        for origin in [true, false] {
            if let Some((_, entry)) = self.inner.streams.remove(&(id, origin)) {
                let _ = entry.intake.send(PumpMsg::End);
                self.inner.events.dispatch(Event::StreamError {
                    id,
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn install(
        &self,
        id: Uuid,
        local_origin: bool,
        remote: Address,
        meta: Option<Value>,
        kind: StreamKind,
    ) -> MuxStream {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (consumer_tx, consumer_rx) = mpsc::channel(self.inner.config.stream_buffer);
        let entry = Arc::new(StreamEntry {
            id,
            local_origin,
            remote,
            meta,
            kind,
            intake: intake_tx,
            peer_paused: AtomicBool::new(false),
            resume_gate: Notify::new(),
            sent_pause: AtomicBool::new(false),
            sent_end: AtomicBool::new(false),
            received_end: AtomicBool::new(false),
        });
        self.inner
            .streams
            .insert((id, local_origin), Arc::clone(&entry));
        tokio::spawn(pump(
            Arc::clone(&entry),
            Arc::clone(&self.inner),
            intake_rx,
            consumer_tx,
        ));
        MuxStream {
            entry,
            mux: Arc::clone(&self.inner),
            rx: consumer_rx,
        }
    }

    fn handle_new(&self, id: Uuid, control: MuxControl) {
        if let Some(existing) = self.inner.streams.get(&(id, false)) {
            // A second announcement for a live id is a protocol fault on
            // the far side; kill the survivor rather than guess.
            warn!(%id, "duplicate stream announcement, force-ending");
            let entry = Arc::clone(existing.value());
            drop(existing);
            let _ = self.inner.control(&entry, MuxOp::End);
            let _ = entry.intake.send(PumpMsg::End);
            self.inner.streams.remove(&(id, false));
            self.inner.events.dispatch(Event::StreamError {
                id,
                reason: "duplicate stream announcement".into(),
            });
            return;
        }
        let Some(from) = control.from else {
            warn!(%id, "stream announcement without return path dropped");
            return;
        };
        let stream = self.install(
            id,
            false,
            Address::new(from),
            control.meta,
            control.mode.unwrap_or_default(),
        );
        if self.inner.accepts_tx.send(stream).is_err() {
            trace!(%id, "stream accepted after multiplexer shutdown");
        }
    }

    fn handle_control(&self, entry: &Arc<StreamEntry>, control: MuxControl) {
        match control.p {
            // New is intercepted before entry lookup; a duplicate for our
            // own id would land here and is ignored.
            MuxOp::New => trace!(id = %entry.id, "unexpected announcement for live stream"),
            MuxOp::End => {
                entry.received_end.store(true, Ordering::SeqCst);
                let _ = entry.intake.send(PumpMsg::End);
                self.inner.retire(entry);
            }
            MuxOp::Pause => {
                entry.peer_paused.store(true, Ordering::SeqCst);
            }
            MuxOp::Resume => {
                entry.peer_paused.store(false, Ordering::SeqCst);
                entry.resume_gate.notify_waiters();
            }
        }
    }
}

impl PathHandler for Multiplexer {
    fn handle(&self, _level: Neighborhood, payload: Value) {
        let frame: MuxFrame = match serde_json::from_value(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed stream frame dropped");
                return;
            }
        };

        if let MuxPayload::Control(control) = &frame.m {
            if control.p == MuxOp::New {
                if !frame.local {
                    warn!(id = %frame.id, "stream announcement with foreign id dropped");
                    return;
                }
                self.handle_new(frame.id, control.clone());
                return;
            }
        }

        // A frame tagged `local` carries the sender's id, which is foreign
        // on this side; our entry for it has the flag flipped.
        let key = (frame.id, !frame.local);
        let Some(entry) = self.inner.streams.get(&key).map(|e| Arc::clone(e.value())) else {
            trace!(id = %frame.id, "frame for unknown stream dropped");
            return;
        };
        match frame.m {
            MuxPayload::Control(control) => self.handle_control(&entry, control),
            MuxPayload::Data(value) => {
                if entry.received_end.load(Ordering::SeqCst) {
                    trace!(id = %frame.id, "data after end dropped");
                    return;
                }
                let _ = entry.intake.send(PumpMsg::Data(value));
            }
        }
    }
}

/// Moves intake frames into the bounded consumer buffer, pausing the peer
/// while the buffer is full.
async fn pump(
    entry: Arc<StreamEntry>,
    mux: Arc<MuxInner>,
    mut intake: mpsc::UnboundedReceiver<PumpMsg>,
    consumer: mpsc::Sender<Value>,
) {
    while let Some(msg) = intake.recv().await {
        match msg {
            PumpMsg::Data(value) => {
                if consumer.capacity() == 0 && !entry.sent_pause.swap(true, Ordering::SeqCst) {
                    if let Err(e) = mux.control(&entry, MuxOp::Pause) {
                        trace!(id = %entry.id, error = %e, "pause not delivered");
                    }
                }
                if consumer.send(value).await.is_err() {
                    // Consumer handle dropped; close if the stream wasn't.
                    if !entry.sent_end.swap(true, Ordering::SeqCst)
                        && !entry.received_end.load(Ordering::SeqCst)
                    {
                        let _ = mux.control(&entry, MuxOp::End);
                    }
                    mux.retire(&entry);
                    break;
                }
            }
            PumpMsg::End => break,
        }
    }
    // Dropping `consumer` lets the reader drain and then observe the end.
}

/// One endpoint of a multiplexed stream
pub struct MuxStream {
    entry: Arc<StreamEntry>,
    mux: Arc<MuxInner>,
    rx: mpsc::Receiver<Value>,
}

impl MuxStream {
    /// The stream id
    pub fn id(&self) -> Uuid {
        self.entry.id
    }

    /// Metadata announced at creation
    pub fn meta(&self) -> Option<&Value> {
        self.entry.meta.as_ref()
    }

    /// Payload mode negotiated at creation
    pub fn kind(&self) -> StreamKind {
        self.entry.kind
    }

    /// Send one payload, waiting while the peer has us paused
    pub async fn send(&self, value: Value) -> Result<()> {
        if self.entry.sent_end.load(Ordering::SeqCst) {
            return Err(Error::Stream(format!(
                "stream {} already ended locally",
                self.entry.id
            )));
        }
        while self.entry.peer_paused.load(Ordering::SeqCst) {
            let notified = self.entry.resume_gate.notified();
            // Recheck after arming to close the race with resume.
            if !self.entry.peer_paused.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        self.mux.send_frame(&self.entry, MuxPayload::Data(value))
    }

    /// Receive the next payload; `None` once the peer ended and the buffer
    /// drained.
    pub async fn recv(&mut self) -> Option<Value> {
        let value = self.rx.recv().await;
        // Buffer drained below the threshold: let the peer send again.
        if value.is_some()
            && self.rx.len() == 0
            && self.entry.sent_pause.swap(false, Ordering::SeqCst)
        {
            if let Err(e) = self.mux.control(&self.entry, MuxOp::Resume) {
                trace!(id = %self.entry.id, error = %e, "resume not delivered");
            }
        }
        value
    }

    /// Close the stream.
    ///
    /// Sends `end` to the peer unless the peer already ended the stream,
    /// in which case the close is purely local.
    pub fn end(&self) {
        if !self.entry.sent_end.swap(true, Ordering::SeqCst) {
            if self.entry.received_end.load(Ordering::SeqCst) {
                trace!(id = %self.entry.id, "peer already ended, closing quietly");
            } else if let Err(e) = self.mux.control(&self.entry, MuxOp::End) {
                trace!(id = %self.entry.id, error = %e, "end not delivered");
            }
        }
        self.mux.retire(&self.entry);
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.end();
    }
}
