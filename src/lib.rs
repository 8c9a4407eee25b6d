//! # textsync — Real-time collaborative text editing
//!
//! Operational-transform sync over length-prefixed JSON frames on TCP.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      TCP / JSON     ┌──────────────┐
//! │ ClientConn   │ ◄─────────────────► │ CollabServer │
//! │ (per user)   │    framed frames    │  (central)   │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ ClientDoc    │                     │ DocModel     │
//! │ (optimistic  │                     │ (snapshot +  │
//! │  mirror)     │                     │  version +   │
//! └──────────────┘                     │  op history) │
//!                                      └──────┬───────┘
//!                                             │
//!                                     ┌───────┴───────┐
//!                                     │  broadcast    │
//!                                     │  (fan-out)    │
//!                                     └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ot`] — the transform algebra over position-based insert/delete ops
//! - [`protocol`] — wire messages and 10-digit length framing
//! - [`model`] — authoritative server-side document state
//! - [`server`] — TCP accept loop and per-connection sessions
//! - [`client`] — client connection, handshake, frame routing
//! - [`doc`] — client document mirror with optimistic local edits

pub mod ot;
pub mod protocol;
pub mod model;
mod session;
pub mod server;
pub mod client;
pub mod doc;

// Re-exports for convenience
pub use ot::{Component, Op, OtError, Side};
pub use protocol::{FrameError, Message};
pub use model::{Committed, DocData, DocModel, ModelConfig, ModelError, SubmittedOp};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{ClientConnection, ClientError, ConnState};
pub use doc::{AckHandle, ClientDoc, DocEvent};
