//! Client-side document mirror.
//!
//! A [`ClientDoc`] applies local edits optimistically and reconciles them
//! with the server's commit stream. At most one operation is in flight at
//! a time; edits made while waiting are composed into a single pending
//! operation that ships when the ack arrives. Remote operations are
//! transformed against both before touching the local snapshot, so the
//! mirror converges on the server's document without ever blocking the
//! editor.

use crate::client::ClientError;
use crate::ot::{self, Component, Op};
use crate::protocol::Message;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Events surfaced to the editor integration.
#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    /// The local snapshot changed through this handle (an optimistic
    /// edit, or a rejection rollback).
    Change,
    /// A remote edit inserted `text` at character position `pos`.
    RemoteInsert { pos: usize, text: String },
    /// A remote edit deleted `text` starting at character position `pos`.
    RemoteDelete { pos: usize, text: String },
    /// The document closed; `Some` carries the failure that caused it,
    /// `None` means a clean close.
    Closed(Option<String>),
}

/// Buffered events per document before new ones are dropped.
const EVENT_CAPACITY: usize = 256;

type AckSender = oneshot::Sender<Result<u64, ClientError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DocPhase {
    Opening,
    Open,
    Closed,
}

/// Shared per-document state, behind a mutex held by both the handle and
/// the connection's reader task.
#[derive(Debug)]
pub(crate) struct DocShared {
    name: String,
    phase: DocPhase,
    snapshot: String,
    version: u64,
    /// The one operation awaiting its ack.
    inflight: Option<Op>,
    inflight_acks: Vec<AckSender>,
    /// Edits composed while waiting; ships when the ack lands.
    pending: Option<Op>,
    pending_acks: Vec<AckSender>,
    open_waiter: Option<oneshot::Sender<Result<(), ClientError>>>,
    close_waiter: Option<oneshot::Sender<Result<(), ClientError>>>,
    events_tx: mpsc::Sender<DocEvent>,
    events_rx: Option<mpsc::Receiver<DocEvent>>,
    out_tx: mpsc::UnboundedSender<Message>,
}

impl DocShared {
    pub(crate) fn new(
        name: String,
        out_tx: mpsc::UnboundedSender<Message>,
        open_waiter: oneshot::Sender<Result<(), ClientError>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        Self {
            name,
            phase: DocPhase::Opening,
            snapshot: String::new(),
            version: 0,
            inflight: None,
            inflight_acks: Vec::new(),
            pending: None,
            pending_acks: Vec::new(),
            open_waiter: Some(open_waiter),
            close_waiter: None,
            events_tx,
            events_rx: Some(events_rx),
            out_tx,
        }
    }

    fn emit(&self, event: DocEvent) {
        if self.events_tx.try_send(event).is_err() {
            log::warn!("event buffer for {:?} is full, dropping an event", self.name);
        }
    }

    fn fail_waiters(&mut self, err: &ClientError) {
        if let Some(w) = self.open_waiter.take() {
            let _ = w.send(Err(err.clone()));
        }
        if let Some(w) = self.close_waiter.take() {
            let _ = w.send(Err(err.clone()));
        }
        for tx in self.inflight_acks.drain(..).chain(self.pending_acks.drain(..)) {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Closes the document with a failure, completing every waiter.
    fn fail(&mut self, err: ClientError) {
        self.phase = DocPhase::Closed;
        self.inflight = None;
        self.pending = None;
        self.fail_waiters(&err);
        self.emit(DocEvent::Closed(Some(err.to_string())));
    }

    /// Ships the pending op if the lane is free.
    fn flush(&mut self) {
        if self.phase != DocPhase::Open || self.inflight.is_some() {
            return;
        }
        let op = match self.pending.take() {
            Some(op) => op,
            None => return,
        };
        if op.is_empty() {
            // edits cancelled out; nothing to send, the acks are trivially
            // satisfied at the current version
            for tx in self.pending_acks.drain(..) {
                let _ = tx.send(Ok(self.version));
            }
            return;
        }
        self.inflight_acks = std::mem::take(&mut self.pending_acks);
        let _ = self.out_tx.send(Message {
            doc: Some(self.name.clone()),
            op: Some(op.clone()),
            v: Some(Some(self.version)),
            ..Default::default()
        });
        self.inflight = Some(op);
    }

    /// Applies a local edit optimistically and queues it for submission.
    pub(crate) fn submit_local(&mut self, op: Op, ack: AckSender) -> Result<(), ClientError> {
        if self.phase != DocPhase::Open {
            return Err(ClientError::NotOpen);
        }
        self.snapshot = ot::apply(&self.snapshot, &op).map_err(ClientError::Ot)?;
        let composed = match self.pending.take() {
            Some(pending) => ot::compose(&pending, &op),
            None => ot::normalize(&op),
        };
        self.pending = Some(composed);
        self.pending_acks.push(ack);
        self.emit(DocEvent::Change);
        self.flush();
        Ok(())
    }

    pub(crate) fn handle_open_reply(&mut self, version: u64, snapshot: String) {
        self.phase = DocPhase::Open;
        self.version = version;
        self.snapshot = snapshot;
        if let Some(w) = self.open_waiter.take() {
            let _ = w.send(Ok(()));
        }
    }

    pub(crate) fn handle_open_failure(&mut self, error: String) {
        self.phase = DocPhase::Closed;
        if let Some(w) = self.open_waiter.take() {
            let _ = w.send(Err(ClientError::Server(error)));
        }
    }

    pub(crate) fn handle_close_reply(&mut self) {
        self.phase = DocPhase::Closed;
        let confirmed = self.close_waiter.take();
        self.fail_waiters(&ClientError::NotOpen);
        if let Some(w) = confirmed {
            let _ = w.send(Ok(()));
        }
        self.emit(DocEvent::Closed(None));
    }

    /// The server committed our in-flight op; `v` is the version the
    /// commit produced.
    pub(crate) fn handle_ack(&mut self, v: u64) {
        if self.inflight.is_none() || v != self.version + 1 {
            self.fail(ClientError::Desync { expected: self.version + 1, got: v });
            return;
        }
        self.version = v;
        self.inflight = None;
        for tx in self.inflight_acks.drain(..) {
            let _ = tx.send(Ok(v));
        }
        self.flush();
    }

    /// The server refused our in-flight op. The snapshot already contains
    /// it, so the rollback applies its inverse, transformed past the
    /// pending op so both stay consistent.
    pub(crate) fn handle_rejection(&mut self, error: String) {
        let inflight = match self.inflight.take() {
            Some(op) => op,
            None => {
                self.fail(ClientError::Server(error));
                return;
            }
        };
        let undo = ot::invert(&inflight);
        let undo = match self.pending.take() {
            Some(pending) => match ot::transform_x(&pending, &undo) {
                Ok((pending, undo)) => {
                    self.pending = Some(pending);
                    undo
                }
                Err(e) => {
                    self.fail(ClientError::Ot(e));
                    return;
                }
            },
            None => undo,
        };
        match ot::apply(&self.snapshot, &undo) {
            Ok(snapshot) => self.snapshot = snapshot,
            Err(e) => {
                self.fail(ClientError::Ot(e));
                return;
            }
        }
        for tx in self.inflight_acks.drain(..) {
            let _ = tx.send(Err(ClientError::Server(error.clone())));
        }
        log::warn!("op on {:?} rejected: {error}", self.name);
        self.emit(DocEvent::Change);
        self.flush();
    }

    /// A remote commit producing version `v`: transform it past our
    /// unacked local ops, then fold it into the snapshot.
    pub(crate) fn handle_remote(&mut self, op: Op, v: u64) {
        if v != self.version + 1 {
            self.fail(ClientError::Desync { expected: self.version + 1, got: v });
            return;
        }
        let mut remote = op;
        // local ops take the left side: our inserts stay before theirs
        if let Some(inflight) = self.inflight.take() {
            match ot::transform_x(&inflight, &remote) {
                Ok((inflight, r)) => {
                    self.inflight = Some(inflight);
                    remote = r;
                }
                Err(e) => {
                    self.fail(ClientError::Ot(e));
                    return;
                }
            }
        }
        if let Some(pending) = self.pending.take() {
            match ot::transform_x(&pending, &remote) {
                Ok((pending, r)) => {
                    self.pending = Some(pending);
                    remote = r;
                }
                Err(e) => {
                    self.fail(ClientError::Ot(e));
                    return;
                }
            }
        }
        match ot::apply(&self.snapshot, &remote) {
            Ok(snapshot) => self.snapshot = snapshot,
            Err(e) => {
                self.fail(ClientError::Ot(e));
                return;
            }
        }
        self.version = v;
        for c in &remote {
            match c {
                Component::Insert { pos, text } => {
                    self.emit(DocEvent::RemoteInsert { pos: *pos, text: text.clone() })
                }
                Component::Delete { pos, text } => {
                    self.emit(DocEvent::RemoteDelete { pos: *pos, text: text.clone() })
                }
            }
        }
    }

    /// The transport died underneath us.
    pub(crate) fn connection_lost(&mut self) {
        self.fail(ClientError::ConnectionClosed);
    }

    pub(crate) fn phase(&self) -> DocPhase {
        self.phase
    }
}

/// Handle to an open document. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ClientDoc {
    shared: Arc<Mutex<DocShared>>,
    name: String,
}

impl ClientDoc {
    pub(crate) fn new(name: String, shared: Arc<Mutex<DocShared>>) -> Self {
        Self { shared, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local snapshot, including unacknowledged local edits.
    pub async fn snapshot(&self) -> String {
        self.shared.lock().await.snapshot.clone()
    }

    /// The last server version this mirror has incorporated.
    pub async fn version(&self) -> u64 {
        self.shared.lock().await.version
    }

    /// Takes the event receiver. Yields `None` after the first call.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<DocEvent>> {
        self.shared.lock().await.events_rx.take()
    }

    /// Inserts `text` at character position `pos`.
    pub async fn insert(&self, pos: usize, text: &str) -> Result<AckHandle, ClientError> {
        self.submit(vec![Component::insert(pos, text)]).await
    }

    /// Deletes `len` characters starting at character position `pos`.
    pub async fn delete(&self, pos: usize, len: usize) -> Result<AckHandle, ClientError> {
        let mut shared = self.shared.lock().await;
        let total = ot::char_len(&shared.snapshot);
        if pos + len > total {
            return Err(ClientError::Ot(ot::OtError::PositionOutOfBounds {
                pos: pos + len,
                len: total,
            }));
        }
        let text = ot::char_slice(&shared.snapshot, pos, pos + len).to_string();
        let (tx, rx) = oneshot::channel();
        shared.submit_local(vec![Component::delete(pos, text)], tx)?;
        Ok(AckHandle { rx })
    }

    /// Submits an arbitrary operation against the current snapshot.
    pub async fn submit(&self, op: Op) -> Result<AckHandle, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.shared.lock().await.submit_local(op, tx)?;
        Ok(AckHandle { rx })
    }

    /// Asks the server to close the document. Resolves when the close is
    /// confirmed; pending acks fail with [`ClientError::NotOpen`].
    pub async fn close(&self) -> Result<(), ClientError> {
        let rx = {
            let mut shared = self.shared.lock().await;
            if shared.phase != DocPhase::Open {
                return Err(ClientError::NotOpen);
            }
            let (tx, rx) = oneshot::channel();
            shared.close_waiter = Some(tx);
            let _ = shared.out_tx.send(Message {
                doc: Some(self.name.clone()),
                open: Some(false),
                ..Default::default()
            });
            rx
        };
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }
}

/// Resolves with the version a submitted op's commit produced, or the
/// reason it never will commit. Every handle is completed exactly once.
pub struct AckHandle {
    rx: oneshot::Receiver<Result<u64, ClientError>>,
}

impl AckHandle {
    pub async fn wait(self) -> Result<u64, ClientError> {
        self.rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_doc(snapshot: &str, version: u64) -> (ClientDoc, mpsc::UnboundedReceiver<Message>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (open_tx, _open_rx) = oneshot::channel();
        let mut shared = DocShared::new("d".to_string(), out_tx, open_tx);
        shared.handle_open_reply(version, snapshot.to_string());
        let shared = Arc::new(Mutex::new(shared));
        (ClientDoc::new("d".to_string(), shared), out_rx)
    }

    #[tokio::test]
    async fn only_one_op_in_flight() {
        let (doc, mut out) = open_doc("abc", 0);
        doc.insert(0, "1").await.unwrap();
        doc.insert(1, "2").await.unwrap();
        doc.insert(2, "3").await.unwrap();

        let sent = out.recv().await.unwrap();
        assert_eq!(sent.op, Some(vec![Component::insert(0, "1")]));
        assert_eq!(sent.version(), Some(0));
        // the other two edits are composed, not sent
        assert!(out.try_recv().is_err());
        assert_eq!(doc.snapshot().await, "123abc");
    }

    #[tokio::test]
    async fn ack_flushes_composed_pending() {
        let (doc, mut out) = open_doc("", 0);
        let first = doc.insert(0, "a").await.unwrap();
        doc.insert(1, "b").await.unwrap();
        doc.insert(2, "c").await.unwrap();
        out.recv().await.unwrap();

        doc.shared.lock().await.handle_ack(1);
        assert_eq!(first.wait().await.unwrap(), 1);

        let second = out.recv().await.unwrap();
        assert_eq!(second.op, Some(vec![Component::insert(1, "bc")]));
        assert_eq!(second.version(), Some(1));
    }

    #[tokio::test]
    async fn rejection_rolls_back_inflight_and_keeps_pending() {
        let (doc, mut out) = open_doc("abc", 0);
        let first = doc.insert(0, "A").await.unwrap();
        let second = doc.insert(1, "B").await.unwrap();
        out.recv().await.unwrap();
        assert_eq!(doc.snapshot().await, "ABabc");

        doc.shared.lock().await.handle_rejection("Op too old".to_string());

        // the inflight insert is undone; the pending one survives,
        // re-based onto the rolled-back snapshot
        assert_eq!(doc.snapshot().await, "Babc");
        assert!(matches!(first.wait().await, Err(ClientError::Server(_))));

        // pending ships next, against the unchanged server version
        let resent = out.recv().await.unwrap();
        assert_eq!(resent.op, Some(vec![Component::insert(0, "B")]));
        assert_eq!(resent.version(), Some(0));
        doc.shared.lock().await.handle_ack(1);
        assert_eq!(second.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remote_op_transformed_past_local_edits() {
        let (doc, mut out) = open_doc("abc", 0);
        doc.insert(3, "!").await.unwrap(); // inflight
        doc.insert(4, "?").await.unwrap(); // pending
        out.recv().await.unwrap();
        assert_eq!(doc.snapshot().await, "abc!?");

        // remote deletes "a", producing version 1
        doc.shared
            .lock()
            .await
            .handle_remote(vec![Component::delete(0, "a")], 1);

        assert_eq!(doc.snapshot().await, "bc!?");
        assert_eq!(doc.version().await, 1);

        // inflight shifted left by the delete
        let shared = doc.shared.lock().await;
        assert_eq!(shared.inflight, Some(vec![Component::insert(2, "!")]));
    }

    #[tokio::test]
    async fn remote_events_reflect_transformed_positions() {
        let (doc, _out) = open_doc("hello", 0);
        let mut events = doc.take_events().await.unwrap();
        assert!(doc.take_events().await.is_none());

        doc.shared
            .lock()
            .await
            .handle_remote(vec![Component::insert(5, " world")], 1);
        doc.shared
            .lock()
            .await
            .handle_remote(vec![Component::delete(0, "hello ")], 2);

        assert_eq!(
            events.recv().await,
            Some(DocEvent::RemoteInsert { pos: 5, text: " world".to_string() })
        );
        assert_eq!(
            events.recv().await,
            Some(DocEvent::RemoteDelete { pos: 0, text: "hello ".to_string() })
        );
        assert_eq!(doc.snapshot().await, "world");
    }

    #[tokio::test]
    async fn version_mismatch_closes_with_desync() {
        let (doc, _out) = open_doc("abc", 0);
        let mut events = doc.take_events().await.unwrap();
        let ack = doc.insert(0, "x").await.unwrap();

        doc.shared
            .lock()
            .await
            .handle_remote(vec![Component::insert(0, "y")], 5);

        match ack.wait().await {
            Err(ClientError::Desync { expected: 1, got: 5 }) => {}
            other => panic!("unexpected ack result: {other:?}"),
        }
        assert_eq!(events.recv().await, Some(DocEvent::Change)); // the local edit
        assert!(matches!(events.recv().await, Some(DocEvent::Closed(Some(_)))));
        assert!(matches!(doc.insert(0, "z").await, Err(ClientError::NotOpen)));
    }

    #[tokio::test]
    async fn insert_then_delete_compose_without_merging() {
        let (doc, mut out) = open_doc("abc", 0);
        let first = doc.insert(0, "x").await.unwrap();
        out.recv().await.unwrap();
        // insert then delete the same character while waiting
        doc.insert(3, "q").await.unwrap();
        let gone = doc.delete(3, 1).await.unwrap();
        assert_eq!(doc.snapshot().await, "xabc");

        doc.shared.lock().await.handle_ack(1);
        assert_eq!(first.wait().await.unwrap(), 1);
        // the textually cancelling pair still ships as one sequential op
        let sent = out.recv().await.unwrap();
        assert_eq!(
            sent.op,
            Some(vec![Component::insert(3, "q"), Component::delete(3, "q")])
        );
        assert_eq!(sent.version(), Some(1));
        doc.shared.lock().await.handle_ack(2);
        assert_eq!(gone.wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn empty_edit_acked_locally() {
        let (doc, mut out) = open_doc("abc", 0);
        let ack = doc.insert(1, "").await.unwrap();
        assert_eq!(ack.wait().await.unwrap(), 0);
        assert!(out.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_edits_emit_change() {
        let (doc, _out) = open_doc("abc", 0);
        let mut events = doc.take_events().await.unwrap();
        doc.insert(0, "x").await.unwrap();
        doc.delete(0, 1).await.unwrap();
        assert_eq!(events.recv().await, Some(DocEvent::Change));
        assert_eq!(events.recv().await, Some(DocEvent::Change));
    }

    #[tokio::test]
    async fn delete_bounds_checked() {
        let (doc, _out) = open_doc("abc", 0);
        assert!(matches!(
            doc.delete(2, 5).await,
            Err(ClientError::Ot(ot::OtError::PositionOutOfBounds { .. }))
        ));
    }

    #[tokio::test]
    async fn connection_loss_fails_every_waiter() {
        let (doc, mut out) = open_doc("abc", 0);
        let a = doc.insert(0, "x").await.unwrap();
        let b = doc.insert(1, "y").await.unwrap();
        out.recv().await.unwrap();

        doc.shared.lock().await.connection_lost();

        assert!(matches!(a.wait().await, Err(ClientError::ConnectionClosed)));
        assert!(matches!(b.wait().await, Err(ClientError::ConnectionClosed)));
        assert!(matches!(doc.close().await, Err(ClientError::NotOpen)));
    }
}
