//! Authoritative server-side document state.
//!
//! One [`DocModel`] owns every document on a server. Each document carries
//! its snapshot, a monotonically increasing version, a bounded ring of
//! recently committed operations (used to transform late-arriving
//! submissions forward), and a broadcast channel acting as the listener
//! set.
//!
//! All mutation funnels through [`DocModel::apply_op`], which holds the
//! document's mutex for the whole validate→transform→apply→notify step.
//! The mutex is the per-document submission queue: acquisition is FIFO, so
//! concurrent submissions against one document serialize while documents
//! never contend with each other.

use crate::ot::{self, Op, Side};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

/// Model tuning.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// How many committed operations each document retains for
    /// transforming stale submissions. Oldest evicted first.
    pub num_cached_ops: usize,
    /// Maximum acceptable submission staleness, in versions. Submissions
    /// older than this are rejected even if still covered by the cache.
    pub maximum_age: u64,
    /// Buffered committed ops per listener before it starts lagging.
    pub listener_capacity: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_cached_ops: 128,
            maximum_age: 64,
            listener_capacity: 256,
        }
    }
}

/// A submission from one connection.
#[derive(Debug, Clone)]
pub struct SubmittedOp {
    pub op: Op,
    /// The document version the client built the op against.
    pub version: u64,
    /// Connection id of the submitter, used to suppress self-echo.
    pub source: u64,
}

/// One committed operation, as delivered to listeners.
#[derive(Debug, Clone)]
pub struct Committed {
    /// The operation after transformation through newer history.
    pub op: Op,
    /// The document version this commit produced.
    pub version: u64,
    /// Connection id of the submitter.
    pub source: u64,
    pub snapshot: String,
    pub old_snapshot: String,
}

/// Read accessor result: a consistent snapshot/version pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocData {
    pub snapshot: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    DocAlreadyExists,
    DocDoesNotExist,
    InvalidDocName,
    OpTooOld,
    OpAtFutureVersion,
    /// An algebraic invariant broke (apply failure or version bookkeeping
    /// mismatch). Details are logged, not exposed.
    Internal,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DocAlreadyExists => write!(f, "Document already exists"),
            Self::DocDoesNotExist => write!(f, "Document does not exist"),
            Self::InvalidDocName => write!(f, "Invalid document name"),
            Self::OpTooOld => write!(f, "Op too old"),
            Self::OpAtFutureVersion => write!(f, "Op at future version"),
            Self::Internal => write!(f, "Internal error"),
        }
    }
}

impl std::error::Error for ModelError {}

struct HistoryEntry {
    version: u64,
    op: Op,
}

struct DocState {
    snapshot: String,
    version: u64,
    history: VecDeque<HistoryEntry>,
}

struct Doc {
    state: Mutex<DocState>,
    committed_tx: broadcast::Sender<Committed>,
}

/// The in-memory document registry. Cheap to share via [`Arc`]; all
/// methods take `&self`.
pub struct DocModel {
    config: ModelConfig,
    docs: RwLock<HashMap<String, Arc<Doc>>>,
}

impl DocModel {
    pub fn new(config: ModelConfig) -> Self {
        Self { config, docs: RwLock::new(HashMap::new()) }
    }

    pub fn with_defaults() -> Self {
        Self::new(ModelConfig::default())
    }

    /// Document names may contain alphanumerics, `.`, `_` and `-`.
    pub fn valid_name(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    }

    /// Creates a document at version 0 with the given initial text.
    pub async fn create(&self, name: &str, snapshot: &str) -> Result<(), ModelError> {
        if !Self::valid_name(name) {
            return Err(ModelError::InvalidDocName);
        }
        let mut docs = self.docs.write().await;
        if docs.contains_key(name) {
            return Err(ModelError::DocAlreadyExists);
        }
        let (committed_tx, _) = broadcast::channel(self.config.listener_capacity);
        docs.insert(
            name.to_string(),
            Arc::new(Doc {
                state: Mutex::new(DocState {
                    snapshot: snapshot.to_string(),
                    version: 0,
                    history: VecDeque::with_capacity(self.config.num_cached_ops),
                }),
                committed_tx,
            }),
        );
        log::info!("created document {name:?} ({} chars)", ot::char_len(snapshot));
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.docs.read().await.contains_key(name)
    }

    /// Removes a document. Listeners see their channel close.
    pub async fn delete(&self, name: &str) -> Result<(), ModelError> {
        let removed = self.docs.write().await.remove(name);
        match removed {
            Some(_) => {
                log::info!("deleted document {name:?}");
                Ok(())
            }
            None => Err(ModelError::DocDoesNotExist),
        }
    }

    pub async fn doc_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.docs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn doc(&self, name: &str) -> Result<Arc<Doc>, ModelError> {
        self.docs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or(ModelError::DocDoesNotExist)
    }

    pub async fn snapshot(&self, name: &str) -> Result<String, ModelError> {
        Ok(self.doc(name).await?.state.lock().await.snapshot.clone())
    }

    pub async fn version(&self, name: &str) -> Result<u64, ModelError> {
        Ok(self.doc(name).await?.state.lock().await.version)
    }

    pub async fn data(&self, name: &str) -> Result<DocData, ModelError> {
        let doc = self.doc(name).await?;
        let state = doc.state.lock().await;
        Ok(DocData { snapshot: state.snapshot.clone(), version: state.version })
    }

    /// Registers a listener. Returns a consistent snapshot/version pair
    /// and a receiver that yields every operation committed after this
    /// call, in commit order. Dropping the receiver deregisters the
    /// listener.
    pub async fn listen(
        &self,
        name: &str,
    ) -> Result<(DocData, broadcast::Receiver<Committed>), ModelError> {
        let doc = self.doc(name).await?;
        // subscribe under the state lock so no commit falls between
        // reading the version and the subscription
        let state = doc.state.lock().await;
        let rx = doc.committed_tx.subscribe();
        Ok((DocData { snapshot: state.snapshot.clone(), version: state.version }, rx))
    }

    /// Commits one submission: transforms it forward through every
    /// operation committed since `submitted.version`, applies it, bumps
    /// the version, and notifies listeners. Returns the document's new
    /// version.
    pub async fn apply_op(&self, name: &str, submitted: SubmittedOp) -> Result<u64, ModelError> {
        let doc = self.doc(name).await?;
        let mut state = doc.state.lock().await;

        if submitted.version > state.version {
            return Err(ModelError::OpAtFutureVersion);
        }
        let age = state.version - submitted.version;
        if age > self.config.maximum_age {
            return Err(ModelError::OpTooOld);
        }
        if age as usize > state.history.len() {
            // the transform chain was evicted
            return Err(ModelError::OpTooOld);
        }

        let mut op = submitted.op;
        let mut at = submitted.version;
        let skip = state.history.len() - age as usize;
        for entry in state.history.iter().skip(skip) {
            op = ot::transform(&op, &entry.op, Side::Left).map_err(|e| {
                log::error!("transform failure on {name:?} at v{}: {e}", entry.version);
                ModelError::Internal
            })?;
            at += 1;
        }
        if at != state.version {
            log::error!(
                "version bookkeeping broke on {name:?}: walked to v{at}, document at v{}",
                state.version
            );
            return Err(ModelError::Internal);
        }

        let new_snapshot = ot::apply(&state.snapshot, &op).map_err(|e| {
            log::error!("apply failure on {name:?} at v{}: {e}", state.version);
            ModelError::Internal
        })?;

        let old_snapshot = std::mem::replace(&mut state.snapshot, new_snapshot);
        state.version += 1;
        let new_version = state.version;
        if state.history.len() == self.config.num_cached_ops {
            state.history.pop_front();
        }
        // entries are tagged with the version the commit produced
        state.history.push_back(HistoryEntry { version: new_version, op: op.clone() });

        log::debug!(
            "commit produced v{new_version} on {name:?} from connection {} ({} components)",
            submitted.source,
            op.len()
        );
        // notify while the state lock is held so listeners observe a
        // strictly increasing version sequence
        let _ = doc.committed_tx.send(Committed {
            op,
            version: new_version,
            source: submitted.source,
            snapshot: state.snapshot.clone(),
            old_snapshot,
        });

        Ok(new_version)
    }
}
