//! # Peer with Async Pump
//!
//! A `Peer` owns one transport and correlates outgoing calls with their answers.
//!
//! A background pump reads every incoming frame. Reply and Fault frames resolve the
//! pending call with the same call-id. Everything else is handed to the owner through the
//! inbox returned by `Peer::new`.
//!
//! ## Invariants
//! - Every pending call is resolved exactly once: by its answer, or with a
//!   `CommunicationFailure` when the connection ends.
//! - Once the peer is closed no new call can be registered, so nothing is left waiting.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;

use sbwrpc::Fault;
use sbwrpc::Frame;

use crate::transport::Transport;

/// The outcome of a call: one encoded result item, or the fault it ended in.
pub type CallResult = std::result::Result<Vec<u8>, Fault>;

/// Frames the pump did not consume.
pub type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

/// Call-id allocator; may be shared between peers to make ids unique across them.
pub type CallIds = Arc<AtomicU32>;

pub fn call_ids() -> CallIds {
    Arc::new(AtomicU32::new(1))
}

/// Encodes the Reply or Fault frame that answers `call_id`.
pub fn encode_answer(call_id: u32, result: CallResult) -> sbwrpc::Result<Vec<u8>> {
    match result {
        Ok(bytes) => Frame::Reply { call_id, result: &bytes }.encode(),
        Err(fault) => Frame::Fault { call_id, fault }.encode(),
    }
}

pub struct Peer {
    name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<DashMap<u32, oneshot::Sender<CallResult>>>,
    call_ids: CallIds,
    closed: watch::Sender<bool>,
}

impl Peer {
    /// Creates a peer and spawns its pump. Must be called inside a tokio runtime.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> (Self, Inbox) {
        Self::with_call_ids(name, transport, call_ids())
    }

    /// As `new`, drawing call-ids from a shared allocator.
    pub fn with_call_ids(name: impl Into<String>, transport: Box<dyn Transport>, call_ids: CallIds) -> (Self, Inbox) {
        let name = name.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending = Arc::new(DashMap::new());
        let closed = watch::Sender::new(false);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let pump_name = name.clone();
        let pump_transport = transport.clone();
        let pump_pending = pending.clone();
        let pump_closed = closed.clone();

        tokio::spawn(async move {
            let reason = loop {
                match pump_transport.recv().await {
                    Ok(Some(msg)) => {
                        if let Err(e) = Self::handle_message(msg, &pump_pending, &inbox_tx) {
                            tracing::warn!(peer = %pump_name, error = %e, "dropping connection after malformed frame");
                            pump_transport.close().await;
                            break e.to_string();
                        }
                    }
                    Ok(None) => break "connection closed by remote".to_string(),
                    Err(e) => break e.to_string(),
                }
            };

            tracing::debug!(peer = %pump_name, %reason, "pump stopped");
            pump_closed.send_replace(true);
            Self::notify_all_pending(&pump_pending, &reason);
        });

        let peer = Self { name, transport, pending, call_ids, closed };
        (peer, inbox_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of calls still waiting for an answer.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has ended, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|c| *c).await;
    }

    fn notify_all_pending(pending: &DashMap<u32, oneshot::Sender<CallResult>>, reason: &str) {
        let keys: Vec<u32> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = pending.remove(&key) {
                let _ = tx.send(Err(Fault::communication(reason)));
            }
        }
    }

    /// Routes one incoming frame.
    fn handle_message(
        msg: Vec<u8>,
        pending: &DashMap<u32, oneshot::Sender<CallResult>>,
        inbox: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> sbwrpc::Result<()> {
        let answer = match Frame::decode(&msg)? {
            Frame::Reply { call_id, result } => Some((call_id, Ok(result.to_vec()))),
            Frame::Fault { call_id, fault } => Some((call_id, Err(fault))),
            _ => None,
        };
        let Some((call_id, result)) = answer else {
            // Nobody listening means the owner is shutting down.
            let _ = inbox.send(msg);
            return Ok(());
        };

        let Some((_, tx)) = pending.remove(&call_id) else {
            tracing::debug!(call_id, "answer for unknown call");
            return Ok(());
        };
        let _ = tx.send(result);
        Ok(())
    }

    /// Registers a pending call and returns its id and the receiver for its answer.
    pub fn prepare_call(&self) -> std::result::Result<(u32, oneshot::Receiver<CallResult>), Fault> {
        let call_id = self.call_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);

        // The pump flags closure before draining, so this either sees the flag or gets drained.
        if self.is_closed() {
            self.pending.remove(&call_id);
            return Err(Fault::communication(format!("{} is closed", self.name)));
        }
        Ok((call_id, rx))
    }

    /// Sends an encoded call frame and awaits its answer.
    pub async fn send_and_await(
        &self,
        call_id: u32,
        payload: Vec<u8>,
        rx: oneshot::Receiver<CallResult>,
    ) -> CallResult {
        if let Err(e) = self.transport.send(&payload).await {
            self.pending.remove(&call_id);
            return Err(e.into());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Fault::communication(format!("{} dropped the call", self.name))),
        }
    }

    /// Allocates a call-id, encodes the frame with it and awaits the answer.
    pub async fn call<F>(&self, encode: F) -> CallResult
    where
        F: FnOnce(u32) -> std::result::Result<Vec<u8>, Fault>,
    {
        let (call_id, rx) = self.prepare_call()?;
        let payload = match encode(call_id) {
            Ok(payload) => payload,
            Err(fault) => {
                self.pending.remove(&call_id);
                return Err(fault);
            }
        };
        self.send_and_await(call_id, payload, rx).await
    }

    /// Sends a frame that expects no answer.
    pub async fn send(&self, payload: &[u8]) -> std::result::Result<(), Fault> {
        Ok(self.transport.send(payload).await?)
    }

    /// Closes the transport and fails every pending call.
    pub async fn close(&self) {
        self.closed.send_replace(true);
        self.transport.close().await;
        Self::notify_all_pending(&self.pending, &format!("{} closed", self.name));
    }
}
