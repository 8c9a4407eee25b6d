//! Operational transform algebra for flat string documents.
//!
//! An operation is an ordered list of [`Component`]s applied sequentially:
//! each component sees the snapshot as left by the components before it.
//! Positions count characters, not bytes.
//!
//! The pairwise transform ([`transform_x`]) is the convergence engine: for
//! two operations `a`, `b` produced concurrently against the same snapshot
//! `s`, `apply(apply(s, a), b') == apply(apply(s, b), a')`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// One insert or delete at a character position.
///
/// Wire shape: `{"p": n, "i": "text"}` or `{"p": n, "d": "text"}`.
/// A missing `p` deserializes as 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Component {
    Insert {
        #[serde(rename = "p", default)]
        pos: usize,
        #[serde(rename = "i")]
        text: String,
    },
    Delete {
        #[serde(rename = "p", default)]
        pos: usize,
        #[serde(rename = "d")]
        text: String,
    },
}

impl Component {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Component::Insert { pos, text: text.into() }
    }

    pub fn delete(pos: usize, text: impl Into<String>) -> Self {
        Component::Delete { pos, text: text.into() }
    }

    pub fn pos(&self) -> usize {
        match self {
            Component::Insert { pos, .. } | Component::Delete { pos, .. } => *pos,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Component::Insert { text, .. } | Component::Delete { text, .. } => text,
        }
    }
}

/// An edit operation: components applied left to right.
pub type Op = Vec<Component>;

/// Which of two concurrent operations this one is, for tie-breaking
/// simultaneous inserts at the same position. The right side's insert
/// lands after the left side's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Errors from the OT algebra. These indicate corrupted or mis-transformed
/// operations and are not recoverable by retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtError {
    /// A delete component's text did not match the snapshot at its position.
    DeleteMismatch {
        pos: usize,
        expected: String,
        actual: String,
    },
    /// Two concurrent deletes removed different text from the same region.
    TransformConflict,
    /// A component addressed a position past the end of the snapshot.
    PositionOutOfBounds { pos: usize, len: usize },
}

impl fmt::Display for OtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeleteMismatch { pos, expected, actual } => write!(
                f,
                "delete component {expected:?} does not match text {actual:?} at position {pos}"
            ),
            Self::TransformConflict => {
                write!(f, "concurrent deletes removed different text from the same region")
            }
            Self::PositionOutOfBounds { pos, len } => {
                write!(f, "position {pos} out of bounds for snapshot of length {len}")
            }
        }
    }
}

impl std::error::Error for OtError {}

/// Number of characters in `s`.
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of character `pos` in `s`, or `None` past the end.
fn byte_index(s: &str, pos: usize) -> Option<usize> {
    if pos == 0 {
        return Some(0);
    }
    let mut seen = 0;
    for (i, _) in s.char_indices() {
        if seen == pos {
            return Some(i);
        }
        seen += 1;
    }
    // pos may address the end of the string
    (seen == pos).then_some(s.len())
}

/// Substring of `s` between character offsets `[from, to)`.
pub(crate) fn char_slice(s: &str, from: usize, to: usize) -> &str {
    let start = byte_index(s, from).unwrap_or(s.len());
    let end = byte_index(s, to).unwrap_or(s.len());
    &s[start..end]
}

/// Applies `op` to `snapshot`, returning the new snapshot.
///
/// A delete component must name exactly the text it removes; a mismatch is
/// an integrity violation surfaced as [`OtError::DeleteMismatch`].
pub fn apply(snapshot: &str, op: &[Component]) -> Result<String, OtError> {
    let mut text = snapshot.to_string();
    for c in op {
        match c {
            Component::Insert { pos, text: ins } => {
                let at = byte_index(&text, *pos).ok_or(OtError::PositionOutOfBounds {
                    pos: *pos,
                    len: char_len(&text),
                })?;
                text.insert_str(at, ins);
            }
            Component::Delete { pos, text: del } => {
                let start = byte_index(&text, *pos).ok_or(OtError::PositionOutOfBounds {
                    pos: *pos,
                    len: char_len(&text),
                })?;
                let end = byte_index(&text, *pos + char_len(del)).ok_or(
                    OtError::PositionOutOfBounds {
                        pos: *pos + char_len(del),
                        len: char_len(&text),
                    },
                )?;
                if &text[start..end] != del {
                    return Err(OtError::DeleteMismatch {
                        pos: *pos,
                        expected: del.clone(),
                        actual: text[start..end].to_string(),
                    });
                }
                text.replace_range(start..end, "");
            }
        }
    }
    Ok(text)
}

/// Appends `c` to `op`, merging with the last component where the two touch
/// the same region. Empty components are dropped.
pub fn append(op: &mut Op, c: Component) {
    if c.text().is_empty() {
        return;
    }
    let merged = match (op.last_mut(), &c) {
        (Some(Component::Insert { pos: lp, text: lt }), Component::Insert { pos, text })
            if *lp <= *pos && *pos <= *lp + char_len(lt) =>
        {
            let at = byte_index(lt, *pos - *lp).unwrap_or(lt.len());
            lt.insert_str(at, text);
            true
        }
        (Some(Component::Delete { pos: lp, text: lt }), Component::Delete { pos, text })
            if *pos <= *lp && *lp <= *pos + char_len(text) =>
        {
            // the new delete surrounds or abuts the previous one
            let cut = byte_index(text, *lp - *pos).unwrap_or(text.len());
            let mut joined = String::with_capacity(lt.len() + text.len());
            joined.push_str(&text[..cut]);
            joined.push_str(lt);
            joined.push_str(&text[cut..]);
            *lt = joined;
            *lp = *pos;
            true
        }
        _ => false,
    };
    if !merged {
        op.push(c);
    }
}

/// Returns the single operation with the net effect of `op1` then `op2`.
pub fn compose(op1: &[Component], op2: &[Component]) -> Op {
    let mut out = op1.to_vec();
    for c in op2 {
        append(&mut out, c.clone());
    }
    out
}

/// Re-folds `op` through [`append`], dropping empty components and merging
/// adjacent ones. Idempotent.
pub fn normalize(op: &[Component]) -> Op {
    compose(&[], op)
}

/// The operation that undoes `op`: components reversed, inserts and deletes
/// swapped.
pub fn invert(op: &[Component]) -> Op {
    op.iter()
        .rev()
        .map(|c| match c {
            Component::Insert { pos, text } => Component::Delete { pos: *pos, text: text.clone() },
            Component::Delete { pos, text } => Component::Insert { pos: *pos, text: text.clone() },
        })
        .collect()
}

/// Adjusts a single position across one component. With `insert_after`, an
/// insert exactly at `pos` pushes it right; otherwise it stays.
pub fn transform_position(pos: usize, c: &Component, insert_after: bool) -> usize {
    match c {
        Component::Insert { pos: p, text } => {
            if *p < pos || (*p == pos && insert_after) {
                pos + char_len(text)
            } else {
                pos
            }
        }
        Component::Delete { pos: p, text } => {
            let len = char_len(text);
            if pos <= *p {
                pos
            } else if pos <= *p + len {
                *p
            } else {
                pos - len
            }
        }
    }
}

/// Transforms `c` across `other`, appending the result (zero, one, or two
/// components) to `dest`.
pub fn transform_component(
    dest: &mut Op,
    c: &Component,
    other: &Component,
    side: Side,
) -> Result<(), OtError> {
    match c {
        Component::Insert { pos, text } => {
            append(
                dest,
                Component::Insert {
                    pos: transform_position(*pos, other, side == Side::Right),
                    text: text.clone(),
                },
            );
        }
        Component::Delete { pos, text } => match other {
            Component::Insert { pos: opos, text: otext } => {
                // split the delete around the inserted text
                let mut rest: &str = text;
                if *pos < *opos {
                    let head = (*opos - *pos).min(char_len(text));
                    let cut = byte_index(text, head).unwrap_or(text.len());
                    append(dest, Component::delete(*pos, &text[..cut]));
                    rest = &text[cut..];
                }
                if !rest.is_empty() {
                    append(dest, Component::delete(*pos + char_len(otext), rest));
                }
            }
            Component::Delete { pos: opos, text: otext } => {
                let c_len = char_len(text);
                let o_len = char_len(otext);
                if *pos >= *opos + o_len {
                    append(dest, Component::delete(*pos - o_len, text.clone()));
                } else if *pos + c_len <= *opos {
                    append(dest, c.clone());
                } else {
                    // overlap: that region was already removed by the other op
                    let mut kept = String::new();
                    if *pos < *opos {
                        let cut = byte_index(text, *opos - *pos).unwrap_or(text.len());
                        kept.push_str(&text[..cut]);
                    }
                    if *pos + c_len > *opos + o_len {
                        let from = byte_index(text, *opos + o_len - *pos).unwrap_or(text.len());
                        kept.push_str(&text[from..]);
                    }
                    let isect_start = (*pos).max(*opos);
                    let isect_end = (*pos + c_len).min(*opos + o_len);
                    let ours = char_slice(text, isect_start - *pos, isect_end - *pos);
                    let theirs = char_slice(otext, isect_start - *opos, isect_end - *opos);
                    if ours != theirs {
                        return Err(OtError::TransformConflict);
                    }
                    if !kept.is_empty() {
                        append(
                            dest,
                            Component::delete(transform_position(*pos, other, false), kept),
                        );
                    }
                }
            }
        },
    }
    Ok(())
}

// How a right-side component fared against one left component.
enum Fate {
    Survived,
    Consumed,
    Split,
}

// One level of pending work: left components already transformed at this
// level, plus the right components still to push through.
struct Frame {
    prefix: Op,
    rights: VecDeque<Component>,
}

/// Simultaneously transforms two concurrent operations against each other.
///
/// Returns `(left', right')` such that applying `left` then `right'` and
/// applying `right` then `left'` converge to the same snapshot.
///
/// When a right component splits against a left insert, the fragments must
/// continue through the remaining left components; that re-splitting runs on
/// an explicit work stack so pathological operations cannot exhaust the call
/// stack.
pub fn transform_x(left: &[Component], right: &[Component]) -> Result<(Op, Op), OtError> {
    let mut cur_left: Op = left.to_vec();
    let mut new_right: Op = Vec::new();
    let mut stack: Vec<Frame> = vec![Frame {
        prefix: Vec::new(),
        rights: right.iter().cloned().collect(),
    }];

    loop {
        let next = match stack.last_mut() {
            Some(frame) => frame.rights.pop_front(),
            None => break,
        };
        match next {
            None => {
                // level finished: fold its result into the parent prefix
                if let Some(done) = stack.pop() {
                    let mut merged = done.prefix;
                    for c in cur_left.drain(..) {
                        append(&mut merged, c);
                    }
                    cur_left = merged;
                }
            }
            Some(mut rc) => {
                let lops = std::mem::take(&mut cur_left);
                let mut new_left: Op = Vec::new();
                let mut fate = Fate::Survived;
                let mut k = 0;
                while k < lops.len() {
                    let mut next_c: Op = Vec::new();
                    transform_component(&mut new_left, &lops[k], &rc, Side::Left)?;
                    transform_component(&mut next_c, &rc, &lops[k], Side::Right)?;
                    k += 1;
                    if next_c.len() == 1 {
                        rc = next_c.remove(0);
                    } else if next_c.is_empty() {
                        for lc in &lops[k..] {
                            append(&mut new_left, lc.clone());
                        }
                        fate = Fate::Consumed;
                        break;
                    } else {
                        stack.push(Frame {
                            prefix: std::mem::take(&mut new_left),
                            rights: next_c.into_iter().collect(),
                        });
                        cur_left = lops[k..].to_vec();
                        fate = Fate::Split;
                        break;
                    }
                }
                match fate {
                    Fate::Survived => {
                        append(&mut new_right, rc);
                        cur_left = new_left;
                    }
                    Fate::Consumed => cur_left = new_left,
                    Fate::Split => {}
                }
            }
        }
    }

    Ok((cur_left, new_right))
}

/// Transforms `op` so it applies after `other`, with `side` breaking
/// positional ties between simultaneous inserts.
pub fn transform(op: &[Component], other: &[Component], side: Side) -> Result<Op, OtError> {
    match side {
        Side::Left => Ok(transform_x(op, other)?.0),
        Side::Right => Ok(transform_x(other, op)?.1),
    }
}
