//! Client connection to a collaboration server.
//!
//! A [`ClientConnection`] owns one socket: a writer task serializes
//! outbound frames from every document sharing the connection, and a
//! reader task routes inbound frames to the right [`DocShared`] (or to a
//! waiting document-list request). When the socket dies, every open
//! document and every waiter is failed with
//! [`ClientError::ConnectionClosed`]; there is no reconnection, callers
//! connect again and reopen.

use crate::doc::{ClientDoc, DocPhase, DocShared};
use crate::ot::OtError;
use crate::protocol::{self, FrameError, Message};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Handshaking,
    Ok,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The connection is gone; every outstanding waiter gets this.
    ConnectionClosed,
    /// The server refused the handshake.
    AuthFailed,
    AlreadyOpen(String),
    NotOpen,
    /// The server rejected a request and said why.
    Server(String),
    /// The local mirror and the server disagree on the version sequence.
    /// The document is closed; reopen to resynchronize.
    Desync { expected: u64, got: u64 },
    Transport(String),
    Ot(OtError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::AuthFailed => write!(f, "authentication failed"),
            Self::AlreadyOpen(name) => write!(f, "document {name:?} is already open"),
            Self::NotOpen => write!(f, "document is not open"),
            Self::Server(e) => write!(f, "server error: {e}"),
            Self::Desync { expected, got } => {
                write!(f, "desynchronized: expected version {expected}, got {got}")
            }
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Ot(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

type ListWaiter = oneshot::Sender<Result<Vec<String>, ClientError>>;

/// Documents and list requests sharing the connection, keyed for the
/// reader task's routing.
#[derive(Default)]
struct Registry {
    docs: HashMap<String, Arc<Mutex<DocShared>>>,
    /// List replies match requests in order.
    pending_lists: VecDeque<ListWaiter>,
}

impl Registry {
    fn fail_all(&mut self) {
        for tx in self.pending_lists.drain(..) {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
        // connection_lost needs the doc lock, deferred to the caller
    }
}

pub struct ClientConnection {
    id: u64,
    state: Arc<RwLock<ConnState>>,
    out_tx: mpsc::UnboundedSender<Message>,
    registry: Arc<Mutex<Registry>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientConnection {
    /// Connects and completes the auth handshake.
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Self::from_stream(stream).await
    }

    pub(crate) async fn from_stream<S>(stream: S) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut rd, mut wr) = tokio::io::split(stream);
        let state = Arc::new(RwLock::new(ConnState::Handshaking));

        // the server speaks first
        let hello = protocol::read_frame(&mut rd)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let id = match hello.auth {
            Some(Some(id)) => id,
            Some(None) => return Err(ClientError::AuthFailed),
            None => {
                return Err(ClientError::Transport("handshake did not start with auth".into()))
            }
        };
        log::debug!("connected as {id}");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if protocol::write_frame(&mut wr, &msg).await.is_err() {
                    break;
                }
            }
        });

        let registry: Arc<Mutex<Registry>> = Arc::new(Mutex::new(Registry::default()));
        let reader = {
            let registry = registry.clone();
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    match protocol::read_frame(&mut rd).await {
                        Ok(msg) => Self::route(&registry, msg).await,
                        Err(FrameError::Closed) => break,
                        Err(e) => {
                            log::warn!("connection {id} read error: {e}");
                            break;
                        }
                    }
                }
                *state.write().await = ConnState::Closed;
                Self::shut_down(&registry).await;
            })
        };

        *state.write().await = ConnState::Ok;
        Ok(Self { id, state, out_tx, registry, reader, writer })
    }

    /// The server-assigned connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn state(&self) -> ConnState {
        *self.state.read().await
    }

    /// Opens an existing document.
    pub async fn open(&self, name: &str) -> Result<ClientDoc, ClientError> {
        self.open_inner(name, None).await
    }

    /// Opens a document, creating it with `initial` if it does not exist.
    pub async fn create(&self, name: &str, initial: &str) -> Result<ClientDoc, ClientError> {
        self.open_inner(name, Some(initial)).await
    }

    async fn open_inner(&self, name: &str, initial: Option<&str>) -> Result<ClientDoc, ClientError> {
        if *self.state.read().await != ConnState::Ok {
            return Err(ClientError::ConnectionClosed);
        }
        let (open_tx, open_rx) = oneshot::channel();
        let shared = {
            let mut reg = self.registry.lock().await;
            if reg.docs.contains_key(name) {
                return Err(ClientError::AlreadyOpen(name.to_string()));
            }
            // registered before the request goes out, so replies and
            // remote ops always find their document
            let shared = Arc::new(Mutex::new(DocShared::new(
                name.to_string(),
                self.out_tx.clone(),
                open_tx,
            )));
            reg.docs.insert(name.to_string(), shared.clone());
            shared
        };
        let request = Message {
            doc: Some(name.to_string()),
            open: Some(true),
            create: initial.is_some().then_some(true),
            snapshot: initial.map(|s| Some(s.to_string())),
            ..Default::default()
        };
        if self.out_tx.send(request).is_err() {
            self.registry.lock().await.docs.remove(name);
            return Err(ClientError::ConnectionClosed);
        }
        match open_rx.await {
            Ok(Ok(())) => Ok(ClientDoc::new(name.to_string(), shared)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Fetches the names of every document on the server.
    pub async fn list_docs(&self) -> Result<Vec<String>, ClientError> {
        if *self.state.read().await != ConnState::Ok {
            return Err(ClientError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.registry.lock().await.pending_lists.push_back(tx);
        if self.out_tx.send(Message { docs: Some(None), ..Default::default() }).is_err() {
            return Err(ClientError::ConnectionClosed);
        }
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Drops the connection. Every open document and outstanding waiter
    /// fails with [`ClientError::ConnectionClosed`].
    pub async fn disconnect(&self) {
        self.reader.abort();
        self.writer.abort();
        *self.state.write().await = ConnState::Closed;
        Self::shut_down(&self.registry).await;
    }

    async fn shut_down(registry: &Mutex<Registry>) {
        let docs: Vec<_> = {
            let mut reg = registry.lock().await;
            reg.fail_all();
            reg.docs.drain().map(|(_, shared)| shared).collect()
        };
        for shared in docs {
            shared.lock().await.connection_lost();
        }
    }

    async fn route(registry: &Mutex<Registry>, msg: Message) {
        if let Some(result) = &msg.docs {
            let waiter = registry.lock().await.pending_lists.pop_front();
            if let Some(tx) = waiter {
                let reply = match result {
                    Some(names) => Ok(names.clone()),
                    None => Err(ClientError::Server(
                        msg.error.clone().unwrap_or_else(|| "list failed".to_string()),
                    )),
                };
                let _ = tx.send(reply);
            } else {
                log::warn!("unsolicited document list");
            }
            return;
        }
        let name = match &msg.doc {
            Some(name) => name.clone(),
            None => {
                log::warn!("unroutable message: {msg:?}");
                return;
            }
        };
        let shared = registry.lock().await.docs.get(&name).cloned();
        let shared = match shared {
            Some(s) => s,
            None => {
                log::warn!("message for unknown document {name:?}");
                return;
            }
        };

        let closed = {
            let mut doc = shared.lock().await;
            match (&msg.open, &msg.op, &msg.v) {
                (Some(true), _, _) => {
                    let snapshot = msg.snapshot.clone().flatten().unwrap_or_default();
                    doc.handle_open_reply(msg.version().unwrap_or(0), snapshot);
                }
                (Some(false), _, _) => match msg.error.clone() {
                    Some(error) if doc.phase() == DocPhase::Opening => {
                        doc.handle_open_failure(error)
                    }
                    _ => doc.handle_close_reply(),
                },
                (None, Some(op), _) => match msg.version() {
                    Some(v) => doc.handle_remote(op.clone(), v),
                    None => log::warn!("remote op without a version on {name:?}"),
                },
                (None, None, Some(Some(v))) => doc.handle_ack(*v),
                (None, None, Some(None)) => {
                    doc.handle_rejection(
                        msg.error.clone().unwrap_or_else(|| "op rejected".to_string()),
                    );
                }
                _ => log::warn!("unrecognized message for {name:?}: {msg:?}"),
            }
            doc.phase() == DocPhase::Closed
        };
        if closed {
            registry.lock().await.docs.remove(&name);
        }
    }
}
