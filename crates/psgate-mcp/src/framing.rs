use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame payload; anything larger is treated
/// as a protocol violation rather than buffered indefinitely.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// `Content-Length: <n>\r\n\r\n<payload>` framing codec.
#[derive(Debug, Default)]
pub struct FrameCodec {
    // Parsed Content-Length of the frame currently being buffered.
    pending: Option<usize>,
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        loop {
            if let Some(len) = self.pending {
                if src.len() < len {
                    src.reserve(len - src.len());
                    return Ok(None);
                }
                self.pending = None;
                return Ok(Some(src.split_to(len)));
            }

            let Some(end) = find(src, HEADER_END) else {
                if src.len() > MAX_FRAME_BYTES {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "header block exceeds frame limit",
                    ));
                }
                return Ok(None);
            };

            let header = &src[..end];
            let len = parse_content_length(header)?;
            if len > MAX_FRAME_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {} bytes exceeds limit", len),
                ));
            }
            src.advance(end + HEADER_END.len());
            self.pending = Some(len);
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> io::Result<()> {
        let payload = item.as_bytes();
        dst.reserve(payload.len() + 32);
        dst.put_slice(format!("Content-Length: {}\r\n\r\n", payload.len()).as_bytes());
        dst.put_slice(payload);
        Ok(())
    }
}

fn parse_content_length(header: &[u8]) -> io::Result<usize> {
    let text = std::str::from_utf8(header)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 frame header"))?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value
                .trim()
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad Content-Length"));
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "missing Content-Length header",
    ))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::default()
            .encode(payload.to_string(), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn round_trip() {
        let mut buf = frame(r#"{"jsonrpc":"2.0"}"#);
        let mut codec = FrameCodec::default();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], br#"{"jsonrpc":"2.0"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_waits() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"Content-Length: 5\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_payload_waits() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"Content-Length: 5\r\n\r\nab"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.put_slice(b"cde");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"abcde");
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut buf = frame("one");
        buf.put_slice(&frame("three")[..]);
        let mut codec = FrameCodec::default();
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"three");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn extra_headers_tolerated() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(
            &b"Content-Type: application/json\r\ncontent-length: 2\r\n\r\nhi"[..],
        );
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hi");
    }

    #[test]
    fn missing_length_is_an_error() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"Content-Type: application/json\r\n\r\n{}"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(&b"Content-Length: 999999999\r\n\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
