//! # Message Framer
//!
//! Newline-delimited JSON framing for both legs of the relay (sensor to drone
//! and drone to central). Implemented as a `tokio_util` codec so sessions can
//! use `FramedRead` / `FramedWrite` instead of hand-rolled read loops.
//!
//! ## Decoding
//! - Bytes accumulate in the session's `BytesMut` until a `\n` is seen; a frame
//!   split across several TCP reads is completed on a later read.
//! - A trailing `\r` before the delimiter is tolerated.
//! - Content that is not a valid `Reading` yields a `FrameError`, and the
//!   session is expected to end on it.
//! - A partial frame still buffered at EOF is discarded.
//!
//! ## Encoding
//! Compact JSON followed by a single `\n`. JSON escaping guarantees the
//! delimiter never appears inside a field value.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::relay::error::FrameError;
use crate::relay::reading::Reading;

/// Frames larger than this are rejected unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

const DELIMITER: u8 = b'\n';

/// Codec turning a byte stream into `Reading`s and `Reading`s into frames.
#[derive(Debug, Clone)]
pub struct ReadingCodec {
    max_frame_bytes: usize,
    /// Where the next delimiter search starts, so bytes already scanned in a
    /// growing partial frame are not scanned again.
    next_index: usize,
}

impl ReadingCodec {
    /// Creates a codec that rejects frames longer than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            next_index: 0,
        }
    }
}

impl Default for ReadingCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

/// Decodes one frame body (delimiter already removed) into a validated reading.
fn parse_frame(body: &[u8]) -> Result<Reading, FrameError> {
    let body = body.strip_suffix(b"\r").unwrap_or(body);
    let reading: Reading = serde_json::from_slice(body)?;
    reading.validate()?;
    Ok(reading)
}

impl Decoder for ReadingCodec {
    type Item = Reading;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reading>, FrameError> {
        let search_from = self.next_index.min(src.len());
        let found = src[search_from..]
            .iter()
            .position(|byte| *byte == DELIMITER)
            .map(|offset| search_from + offset);

        match found {
            Some(end) => {
                self.next_index = 0;
                if end > self.max_frame_bytes {
                    return Err(FrameError::TooLong {
                        max: self.max_frame_bytes,
                    });
                }
                let frame = src.split_to(end + 1);
                parse_frame(&frame[..end]).map(Some)
            }
            None if src.len() > self.max_frame_bytes => Err(FrameError::TooLong {
                max: self.max_frame_bytes,
            }),
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Reading>, FrameError> {
        match self.decode(src)? {
            Some(reading) => Ok(Some(reading)),
            None => {
                if !src.is_empty() {
                    debug!(bytes = src.len(), "discarding partial frame at end of stream");
                    src.clear();
                }
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<&Reading> for ReadingCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Reading, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = serde_json::to_vec(item)?;
        dst.reserve(body.len() + 1);
        dst.extend_from_slice(&body);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    const FRAME: &str =
        r#"{"sensor_id":"s1","temperature":25,"humidity":50,"timestamp":"2024-05-01T12:00:00Z"}"#;

    #[test]
    fn partial_frame_is_completed_on_next_read() {
        let mut codec = ReadingCodec::default();
        let mut buf = BytesMut::from(&FRAME.as_bytes()[..30]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 30, "partial frame must be retained");

        buf.extend_from_slice(&FRAME.as_bytes()[30..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\n");
        let reading = codec.decode(&mut buf).unwrap().expect("frame complete");
        assert_eq!(reading.sensor_id, "s1");
        assert!(buf.is_empty());
    }

    #[test]
    fn several_frames_in_one_read_decode_in_order() {
        let mut codec = ReadingCodec::default();
        let second = FRAME.replace("\"s1\"", "\"s2\"");
        let mut buf = BytesMut::from(format!("{FRAME}\n{second}\n").as_bytes());

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let next = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.sensor_id, "s1");
        assert_eq!(next.sensor_id, "s2");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn carriage_return_before_delimiter_is_tolerated() {
        let mut codec = ReadingCodec::default();
        let mut buf = BytesMut::from(format!("{FRAME}\r\n").as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn malformed_frame_is_an_error() {
        let mut codec = ReadingCodec::default();
        let mut buf = BytesMut::from(&b"{not json}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let mut codec = ReadingCodec::default();
        let mut buf = BytesMut::from(&br#"{"sensor_id":"s1","temperature":1}"#[..]);
        buf.extend_from_slice(b"\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn schema_valid_but_invalid_reading_is_rejected() {
        let mut codec = ReadingCodec::default();
        let raw = FRAME.replace("\"s1\"", "\"\"");
        let mut buf = BytesMut::from(format!("{raw}\n").as_bytes());
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::Invalid(_))));
    }

    #[test]
    fn oversized_frame_without_delimiter_is_rejected() {
        let mut codec = ReadingCodec::new(16);
        let mut buf = BytesMut::from(&[b'x'; 32][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLong { max: 16 })
        ));
    }

    #[test]
    fn encode_appends_single_delimiter() {
        let mut codec = ReadingCodec::default();
        let mut dst = BytesMut::new();
        let reading = Reading::new("s1", 25.0, 50.0, "2024-05-01T12:00:00Z");
        codec.encode(&reading, &mut dst).unwrap();

        assert_eq!(dst.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(dst.last(), Some(&b'\n'));
        let decoded = codec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(decoded, reading);
    }

    #[tokio::test]
    async fn partial_frame_at_eof_is_discarded() {
        let input = format!("{FRAME}\n{{\"sensor_id\":\"s2\"");
        let mut frames = FramedRead::new(input.as_bytes(), ReadingCodec::default());

        let first = frames.next().await.expect("one frame").expect("valid frame");
        assert_eq!(first.sensor_id, "s1");
        assert!(frames.next().await.is_none());
    }
}
