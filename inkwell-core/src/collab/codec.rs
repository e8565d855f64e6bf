//! Binary codec for updates, snapshots and state vectors.
//!
//! Wire format:
//! ```text
//! update:        ┌──────┬──────────────────┐
//!                │ 0x01 │ bincode(Update)  │
//!                └──────┴──────────────────┘
//! snapshot:      ┌──────┬───────────┬─────────────┬──────────────┬─────┐
//!                │ 0x02 │ count u32 │ len₀ u32    │ update frame │ ... │
//!                └──────┴───────────┴─────────────┴──────────────┴─────┘
//! state vector:  ┌──────┬──────────────────────┐
//!                │ 0x03 │ bincode(StateVector) │
//!                └──────┴──────────────────────┘
//! ```
//! Integers in the snapshot container are little-endian. Snapshot entries
//! are complete update frames, so the relay can assemble a snapshot from
//! frames it never decoded.
//!
//! Every decoder is total: any byte sequence yields a value or a
//! [`DecodeError`], never a panic.

use bincode::config::Config;
use thiserror::Error;

use super::ids::StateVector;
use super::update::{Snapshot, Update};

pub const UPDATE_TAG: u8 = 0x01;
pub const SNAPSHOT_TAG: u8 = 0x02;
pub const STATE_VECTOR_TAG: u8 = 0x03;

/// Upper bound on any single encoded frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty input")]
    Empty,
    #[error("unknown format tag {tag:#04x}, expected {expected:#04x}")]
    UnknownFormat { tag: u8, expected: u8 },
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    TooLarge { len: usize, limit: usize },
}

fn config() -> impl Config {
    bincode::config::standard().with_limit::<MAX_FRAME_LEN>()
}

// ───────────────────────────────────────────────────────────────
// Updates
// ───────────────────────────────────────────────────────────────

pub fn encode(update: &Update) -> Vec<u8> {
    tagged(UPDATE_TAG, update)
}

pub fn decode(bytes: &[u8]) -> Result<Update, DecodeError> {
    untag(bytes, UPDATE_TAG)
}

// ───────────────────────────────────────────────────────────────
// Snapshots
// ───────────────────────────────────────────────────────────────

pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    let frames: Vec<Vec<u8>> = snapshot.updates.iter().map(encode).collect();
    frame_snapshot(&frames)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, DecodeError> {
    let updates = snapshot_frames(bytes)?
        .into_iter()
        .map(decode)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Snapshot::new(updates))
}

/// Assemble a snapshot container from already encoded update frames.
pub fn frame_snapshot<I, F>(frames: I) -> Vec<u8>
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    let mut out = vec![SNAPSHOT_TAG, 0, 0, 0, 0];
    let mut count: u32 = 0;
    for frame in frames {
        let frame = frame.as_ref();
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
        count += 1;
    }
    out[1..5].copy_from_slice(&count.to_le_bytes());
    out
}

/// Split a snapshot container into its update frames without decoding them.
pub fn snapshot_frames(bytes: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    let mut rest = check_tag(bytes, SNAPSHOT_TAG)?;
    let count = read_u32(&mut rest)? as usize;

    // every entry carries at least its 4-byte length
    let mut frames = Vec::with_capacity(count.min(rest.len() / 4));
    for _ in 0..count {
        let len = read_u32(&mut rest)? as usize;
        if len > MAX_FRAME_LEN {
            return Err(DecodeError::TooLarge {
                len,
                limit: MAX_FRAME_LEN,
            });
        }
        if rest.len() < len {
            return Err(DecodeError::Truncated {
                needed: len,
                available: rest.len(),
            });
        }
        let (frame, tail) = rest.split_at(len);
        frames.push(frame);
        rest = tail;
    }

    if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes(rest.len()));
    }
    Ok(frames)
}

// ───────────────────────────────────────────────────────────────
// State vectors
// ───────────────────────────────────────────────────────────────

pub fn encode_state_vector(state_vector: &StateVector) -> Vec<u8> {
    tagged(STATE_VECTOR_TAG, state_vector)
}

pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, DecodeError> {
    untag(bytes, STATE_VECTOR_TAG)
}

// ───────────────────────────────────────────────────────────────
// Helpers
// ───────────────────────────────────────────────────────────────

fn tagged<T: serde::Serialize>(tag: u8, value: &T) -> Vec<u8> {
    let mut out = vec![tag];
    if let Err(e) = bincode::serde::encode_into_std_write(value, &mut out, config()) {
        log::error!("Encoding frame {tag:#04x} failed: {e}");
        out.truncate(1);
    }
    out
}

fn untag<T: serde::de::DeserializeOwned>(bytes: &[u8], tag: u8) -> Result<T, DecodeError> {
    let body = check_tag(bytes, tag)?;
    let (value, consumed) =
        bincode::serde::decode_from_slice(body, config()).map_err(|e| map_bincode(e, body.len()))?;
    if consumed < body.len() {
        return Err(DecodeError::TrailingBytes(body.len() - consumed));
    }
    Ok(value)
}

fn check_tag(bytes: &[u8], expected: u8) -> Result<&[u8], DecodeError> {
    let (&tag, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if tag != expected {
        return Err(DecodeError::UnknownFormat { tag, expected });
    }
    if body.len() > MAX_FRAME_LEN {
        return Err(DecodeError::TooLarge {
            len: body.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    Ok(body)
}

fn read_u32(rest: &mut &[u8]) -> Result<u32, DecodeError> {
    if rest.len() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4,
            available: rest.len(),
        });
    }
    let (head, tail) = rest.split_at(4);
    *rest = tail;
    Ok(u32::from_le_bytes([head[0], head[1], head[2], head[3]]))
}

fn map_bincode(err: bincode::error::DecodeError, available: usize) -> DecodeError {
    match err {
        bincode::error::DecodeError::UnexpectedEnd { additional } => DecodeError::Truncated {
            needed: available + additional,
            available,
        },
        bincode::error::DecodeError::LimitExceeded => DecodeError::TooLarge {
            len: available,
            limit: MAX_FRAME_LEN,
        },
        other => DecodeError::Malformed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::ids::{ActorId, ElementId};
    use crate::collab::update::Op;
    use crate::{Color, Point, Rect, Shape};

    fn insert(clock: u64, shape: Shape) -> Update {
        let origin = ActorId::from("alice");
        Update::new(
            origin.clone(),
            clock + 1,
            vec![Op::Insert {
                id: ElementId::new(clock, origin),
                anchor: None,
                shape,
            }],
        )
    }

    #[test]
    fn test_update_roundtrip() {
        let origin = ActorId::from("alice");
        let update = Update::new(
            origin.clone(),
            9,
            vec![
                Op::Insert {
                    id: ElementId::new(7, origin.clone()),
                    anchor: Some(ElementId::new(3, ActorId::from("bob"))),
                    shape: Shape::ellipse("e", Color::new("#123456"), Rect::new(1.0, 2.0, 3.0, 4.0)),
                },
                Op::Delete {
                    id: ElementId::new(3, ActorId::from("bob")),
                },
            ],
        );

        let bytes = encode(&update);
        assert_eq!(bytes[0], UPDATE_TAG);
        assert_eq!(decode(&bytes).unwrap(), update);
    }

    #[test]
    fn test_empty_stroke_roundtrip() {
        let update = insert(1, Shape::stroke("s", Color::default(), Vec::new()));
        assert_eq!(decode(&encode(&update)).unwrap(), update);
    }

    #[test]
    fn test_long_stroke_roundtrip() {
        let points = (0..10_000).map(|i| Point::new(i as f32, (i * 2) as f32)).collect();
        let update = insert(1, Shape::stroke("s", Color::default(), points));
        let decoded = decode(&encode(&update)).unwrap();

        let Some((_, Shape::Stroke(stroke))) = decoded.inserts().next() else {
            panic!("Expected a stroke insert");
        };
        assert_eq!(stroke.points.len(), 10_000);
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_decode_empty_input() {
        assert_eq!(decode(&[]), Err(DecodeError::Empty));
        assert_eq!(decode_snapshot(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn test_decode_unknown_tag() {
        let err = decode(&[0x7f, 1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::UnknownFormat {
                tag: 0x7f,
                expected: UPDATE_TAG
            }
        );
    }

    #[test]
    fn test_decode_truncated_update() {
        let bytes = encode(&insert(1, Shape::rect("r", Color::default(), Rect::default())));
        for cut in 1..bytes.len() {
            assert!(decode(&bytes[..cut]).is_err(), "cut at {cut} decoded");
        }
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = encode(&insert(1, Shape::rect("r", Color::default(), Rect::default())));
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(decode(&bytes), Err(DecodeError::TrailingBytes(2)));
    }

    #[test]
    fn test_decode_garbage_never_panics() {
        for seed in 0u8..=255 {
            let garbage: Vec<u8> = (0..32).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect();
            let _ = decode(&garbage);
            let _ = decode_snapshot(&garbage);
            let _ = decode_state_vector(&garbage);
        }
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = Snapshot::new(vec![
            insert(1, Shape::rect("a", Color::default(), Rect::default())),
            insert(3, Shape::stroke("b", Color::default(), vec![Point::new(1.0, 1.0)])),
        ]);
        let bytes = encode_snapshot(&snapshot);
        assert_eq!(bytes[0], SNAPSHOT_TAG);
        assert_eq!(decode_snapshot(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_empty_snapshot() {
        let bytes = encode_snapshot(&Snapshot::default());
        assert_eq!(bytes, vec![SNAPSHOT_TAG, 0, 0, 0, 0]);
        assert!(decode_snapshot(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_frame_snapshot_from_raw_frames() {
        let a = encode(&insert(1, Shape::rect("a", Color::default(), Rect::default())));
        let b = encode(&insert(2, Shape::rect("b", Color::default(), Rect::default())));

        let bytes = frame_snapshot([a.as_slice(), b.as_slice()]);
        let frames = snapshot_frames(&bytes).unwrap();
        assert_eq!(frames, vec![a.as_slice(), b.as_slice()]);
    }

    #[test]
    fn test_snapshot_keeps_bad_frame_isolated() {
        let good = encode(&insert(1, Shape::rect("a", Color::default(), Rect::default())));
        let bytes = frame_snapshot([good.as_slice(), &[0xEE, 0x01][..]]);

        let frames = snapshot_frames(&bytes).unwrap();
        assert!(decode(frames[0]).is_ok());
        assert!(decode(frames[1]).is_err());
        assert!(decode_snapshot(&bytes).is_err());
    }

    #[test]
    fn test_snapshot_truncated_container() {
        let bytes = encode_snapshot(&Snapshot::new(vec![insert(
            1,
            Shape::rect("a", Color::default(), Rect::default()),
        )]));
        let err = snapshot_frames(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { .. }));

        // count claims far more entries than the bytes hold
        let lying = vec![SNAPSHOT_TAG, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(
            snapshot_frames(&lying),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_state_vector_roundtrip() {
        let mut sv = StateVector::new();
        sv.observe(&ActorId::from("alice"), 12);
        sv.observe(&ActorId::from("bob"), 3);

        let bytes = encode_state_vector(&sv);
        assert_eq!(decode_state_vector(&bytes).unwrap(), sv);
        assert!(matches!(
            decode_state_vector(&encode(&Update::empty(ActorId::from("a"), 0))),
            Err(DecodeError::UnknownFormat { .. })
        ));
    }
}
