//! Per-connection server-side session.
//!
//! One session owns one client connection: it pushes the auth handshake,
//! dispatches the client's requests against the shared [`DocModel`], and
//! runs one forwarder task per open document that relays committed
//! operations back to the client.
//!
//! Outbound traffic is serialized through a single mpsc writer task, so
//! replies and relayed operations share one FIFO queue. Acknowledgments
//! for this session's own submissions are emitted by the forwarder (not
//! the dispatch loop) when a committed op's source matches the session
//! id, which guarantees that every remote op committed before ours is on
//! the wire before our ack.

use crate::model::{DocModel, SubmittedOp};
use crate::protocol::{self, FrameError, Message};
use crate::server::ServerStats;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub(crate) enum SessionError {
    Frame(FrameError),
    /// The client sent something the protocol does not allow. Fatal.
    Protocol(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "{e}"),
            Self::Protocol(what) => write!(f, "protocol violation: {what}"),
        }
    }
}

impl From<FrameError> for SessionError {
    fn from(e: FrameError) -> Self {
        SessionError::Frame(e)
    }
}

pub(crate) struct Session {
    id: u64,
    model: Arc<DocModel>,
    stats: Arc<RwLock<ServerStats>>,
    out_tx: mpsc::UnboundedSender<Message>,
    /// Forwarder task per open document.
    open_docs: HashMap<String, JoinHandle<()>>,
}

impl Session {
    /// Runs a session to completion. Returns once the client disconnects
    /// or commits a protocol violation.
    pub(crate) async fn run<S>(
        stream: S,
        id: u64,
        model: Arc<DocModel>,
        stats: Arc<RwLock<ServerStats>>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = protocol::write_frame(&mut wr, &msg).await {
                    log::debug!("write to connection failed: {e}");
                    break;
                }
            }
        });

        let mut session = Session {
            id,
            model,
            stats,
            out_tx,
            open_docs: HashMap::new(),
        };

        // handshake: the connection id, pushed before anything else
        let _ = session.out_tx.send(Message::auth(id));

        loop {
            match protocol::read_frame(&mut rd).await {
                Ok(msg) => {
                    session.stats.write().await.messages_received += 1;
                    if let Err(e) = session.dispatch(msg).await {
                        log::warn!("connection {id}: {e}");
                        break;
                    }
                }
                Err(FrameError::Closed) => {
                    log::info!("connection {id} closed");
                    break;
                }
                Err(e) => {
                    log::warn!("connection {id}: {e}");
                    break;
                }
            }
        }

        for (_, forwarder) in session.open_docs.drain() {
            forwarder.abort();
        }
        writer.abort();
    }

    async fn dispatch(&mut self, msg: Message) -> Result<(), SessionError> {
        if msg.docs.is_some() {
            let names = self.model.doc_names().await;
            self.send(Message::doc_list(names));
            return Ok(());
        }
        let name = match msg.doc.clone() {
            Some(name) => name,
            None => return Err(SessionError::Protocol("message without a document".into())),
        };
        if let Some(op) = msg.op.clone() {
            self.handle_op(&name, op, msg.version()).await
        } else {
            match msg.open {
                Some(true) => self.handle_open(&name, msg).await,
                Some(false) => self.handle_close(&name).await,
                None => Err(SessionError::Protocol("message without an action".into())),
            }
        }
    }

    async fn handle_open(&mut self, name: &str, msg: Message) -> Result<(), SessionError> {
        if self.open_docs.contains_key(name) {
            self.send(Self::open_failure(&msg, "Document already open"));
            return Ok(());
        }

        if msg.create == Some(true) {
            let initial = msg
                .snapshot
                .as_ref()
                .and_then(|s| s.as_deref())
                .unwrap_or("");
            match self.model.create(name, initial).await {
                Ok(()) => {}
                // lost the race to another creator; opening it is still fine
                Err(crate::model::ModelError::DocAlreadyExists) => {}
                Err(e) => {
                    self.send(Self::open_failure(&msg, &e.to_string()));
                    return Ok(());
                }
            }
        }

        let (data, rx) = match self.model.listen(name).await {
            Ok(pair) => pair,
            Err(e) => {
                self.send(Self::open_failure(&msg, &e.to_string()));
                return Ok(());
            }
        };

        // the reply is queued before the forwarder starts, so anything
        // buffered in rx lands after it on the wire
        self.send(Message::open_reply(name, data.version, &data.snapshot));
        let forwarder = self.spawn_forwarder(name.to_string(), rx);
        self.open_docs.insert(name.to_string(), forwarder);
        log::debug!("connection {} opened {name:?} at v{}", self.id, data.version);
        Ok(())
    }

    async fn handle_close(&mut self, name: &str) -> Result<(), SessionError> {
        match self.open_docs.remove(name) {
            Some(forwarder) => {
                forwarder.abort();
                self.send(Message::close_reply(name));
                log::debug!("connection {} closed {name:?}", self.id);
            }
            None => {
                self.send(Message {
                    doc: Some(name.to_string()),
                    open: Some(false),
                    error: Some("Document is not open".to_string()),
                    ..Default::default()
                });
            }
        }
        Ok(())
    }

    async fn handle_op(
        &mut self,
        name: &str,
        op: crate::ot::Op,
        version: Option<u64>,
    ) -> Result<(), SessionError> {
        if !self.open_docs.contains_key(name) {
            return Err(SessionError::Protocol(format!("op against unopened {name:?}")));
        }
        let version = match version {
            Some(v) => v,
            None => return Err(SessionError::Protocol("op without a version".into())),
        };

        let submitted = SubmittedOp { op, version, source: self.id };
        match self.model.apply_op(name, submitted).await {
            Ok(_) => {
                // the ack rides the forwarder, after every earlier commit
                self.stats.write().await.ops_committed += 1;
            }
            Err(e) => self.send(Message::op_rejection(name, e.to_string())),
        }
        Ok(())
    }

    fn spawn_forwarder(
        &self,
        name: String,
        mut rx: broadcast::Receiver<crate::model::Committed>,
    ) -> JoinHandle<()> {
        let out_tx = self.out_tx.clone();
        let id = self.id;
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(committed) => {
                        let msg = if committed.source == id {
                            Message::op_ack(&name, committed.version)
                        } else {
                            Message::remote_op(&name, committed.op, committed.version)
                        };
                        if out_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("connection {id} lagged {n} ops behind on {name:?}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn send(&self, msg: Message) {
        // a send failure means the writer died; the read loop will notice
        let _ = self.out_tx.send(msg);
    }

    /// Failure reply to an open request, echoing the request's flags in
    /// their negative/null form.
    fn open_failure(request: &Message, error: &str) -> Message {
        Message {
            doc: request.doc.clone(),
            open: Some(false),
            create: request.create.map(|_| false),
            snapshot: request.snapshot.as_ref().map(|_| None),
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}
