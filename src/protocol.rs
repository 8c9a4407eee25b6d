//! Wire protocol: length-prefixed JSON messages.
//!
//! Framing:
//! ```text
//! ┌────────────────────┬───────────────────┐
//! │ length header      │ payload           │
//! │ 10 ASCII digits,   │ UTF-8 JSON,       │
//! │ zero-padded        │ exactly that long │
//! └────────────────────┴───────────────────┘
//! ```
//!
//! The framing is symmetric: client and server read and write the same
//! shape. Every message is one JSON object; which fields are present
//! determines what it means (see the field docs on [`Message`]).

use crate::ot::Op;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed width of the decimal length header.
pub const LENGTH_HEADER: usize = 10;

/// Upper bound on a single frame's payload. A header past this aborts the
/// connection before any allocation happens.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// Distinguishes an absent field from an explicit `null`: absent stays
// `None` via `default`, a present field (null or not) becomes `Some(..)`.
fn present<'de, T, D>(de: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(de).map(Some)
}

/// One protocol message. All fields optional; absent fields are omitted
/// from the JSON entirely, while `auth`, `docs`, `snapshot` and `v` can
/// also carry an explicit `null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// S→C handshake: the connection id, or `null` on auth failure.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub auth: Option<Option<u64>>,
    /// C→S `null` requests the document list; S→C carries it (or `null`
    /// with `error`).
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub docs: Option<Option<Vec<String>>>,
    /// Document name this message concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
    /// `true` opens (C→S) or confirms an open (S→C); `false` closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<bool>,
    /// C→S: create the document if it does not exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    /// Initial text on create (C→S), current text on open reply (S→C).
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Option<String>>,
    /// Document version; `null` in a rejected op acknowledgment.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub v: Option<Option<u64>>,
    /// Operation components, for submissions and remote-op relays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Op>,
    /// Human-readable failure, alongside whichever reply it qualifies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    pub fn auth(id: u64) -> Self {
        Message { auth: Some(Some(id)), ..Default::default() }
    }

    pub fn doc_list(names: Vec<String>) -> Self {
        Message { docs: Some(Some(names)), ..Default::default() }
    }

    pub fn open_reply(doc: &str, v: u64, snapshot: &str) -> Self {
        Message {
            doc: Some(doc.to_string()),
            open: Some(true),
            v: Some(Some(v)),
            snapshot: Some(Some(snapshot.to_string())),
            ..Default::default()
        }
    }

    pub fn close_reply(doc: &str) -> Self {
        Message { doc: Some(doc.to_string()), open: Some(false), ..Default::default() }
    }

    pub fn op_ack(doc: &str, v: u64) -> Self {
        Message { doc: Some(doc.to_string()), v: Some(Some(v)), ..Default::default() }
    }

    pub fn op_rejection(doc: &str, error: String) -> Self {
        Message {
            doc: Some(doc.to_string()),
            v: Some(None),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn remote_op(doc: &str, op: Op, v: u64) -> Self {
        Message {
            doc: Some(doc.to_string()),
            op: Some(op),
            v: Some(Some(v)),
            ..Default::default()
        }
    }

    /// Flattens the double-option `v` into a plain version, if any.
    pub fn version(&self) -> Option<u64> {
        self.v.flatten()
    }
}

/// Framing and transport failures. All of these are fatal to the
/// connection they occur on.
#[derive(Debug)]
pub enum FrameError {
    /// The peer closed the stream at a frame boundary.
    Closed,
    /// The 10-byte header was not a decimal length.
    BadHeader,
    /// A header announced a payload larger than [`MAX_FRAME_LEN`].
    Oversized(usize),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::BadHeader => write!(f, "malformed length header"),
            Self::Oversized(n) => write!(f, "frame of {n} bytes exceeds maximum"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "malformed message: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Closed
        } else {
            FrameError::Io(e)
        }
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self {
        FrameError::Json(e)
    }
}

/// Writes one framed message.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &Message) -> Result<(), FrameError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(body.len()));
    }
    let header = format!("{:0width$}", body.len(), width = LENGTH_HEADER);
    w.write_all(header.as_bytes()).await?;
    w.write_all(&body).await?;
    w.flush().await?;
    Ok(())
}

/// Reads one framed message, blocking until a full frame arrives.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, FrameError> {
    let mut header = [0u8; LENGTH_HEADER];
    r.read_exact(&mut header).await?;
    let len: usize = std::str::from_utf8(&header)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(FrameError::BadHeader)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::Component;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Message::remote_op("notes", vec![Component::insert(3, "hi")], 7);
        write_frame(&mut a, &msg).await.unwrap();
        let back = read_frame(&mut b).await.unwrap();
        assert_eq!(back, msg);
    }

    #[tokio::test]
    async fn header_is_zero_padded_decimal() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Message::close_reply("x")).await.unwrap();
        let mut header = [0u8; LENGTH_HEADER];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut header).await.unwrap();
        let text = std::str::from_utf8(&header).unwrap();
        assert!(text.chars().all(|c| c.is_ascii_digit()), "header {text:?}");
        let len: usize = text.parse().unwrap();
        let mut body = vec![0u8; len];
        tokio::io::AsyncReadExt::read_exact(&mut b, &mut body).await.unwrap();
        assert_eq!(body.len(), len);
    }

    #[tokio::test]
    async fn bad_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"xxxxxxxxxx{}").await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(FrameError::BadHeader)));
    }

    #[tokio::test]
    async fn oversized_header_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"9999999999").await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(FrameError::Oversized(_))));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_closed() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::io::AsyncWriteExt::write_all(&mut a, b"00000").await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(FrameError::Closed)));
    }

    #[test]
    fn null_and_absent_fields_differ() {
        // list request: docs present but null
        let m: Message = serde_json::from_str(r#"{"docs":null}"#).unwrap();
        assert_eq!(m.docs, Some(None));
        // no docs field at all
        let m: Message = serde_json::from_str(r#"{"doc":"a","open":false}"#).unwrap();
        assert_eq!(m.docs, None);
        // rejected ack: v present but null
        let m: Message = serde_json::from_str(r#"{"doc":"a","v":null,"error":"Op too old"}"#).unwrap();
        assert_eq!(m.v, Some(None));
        assert_eq!(m.version(), None);
    }

    #[test]
    fn absent_fields_not_serialized() {
        let text = serde_json::to_string(&Message::op_ack("a", 3)).unwrap();
        assert_eq!(text, r#"{"doc":"a","v":3}"#);
        let text = serde_json::to_string(&Message::op_rejection("a", "Op too old".into())).unwrap();
        assert_eq!(text, r#"{"doc":"a","v":null,"error":"Op too old"}"#);
    }

    #[test]
    fn auth_null_round_trip() {
        let m = Message { auth: Some(None), error: Some("denied".into()), ..Default::default() };
        let text = serde_json::to_string(&m).unwrap();
        assert_eq!(text, r#"{"auth":null,"error":"denied"}"#);
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back.auth, Some(None));
    }
}
