// SPDX-License-Identifier: MIT
//! Wire framing for the two stdio protocols.
//!
//! The CLI server speaks a NUL-delimited protocol: one JSON array of command
//! arguments terminated by a NUL byte per request, one NUL-terminated text
//! response per command. The language server and query server both use
//! `Content-Length: <n>\r\n\r\n<body>` framing (LSP-style) around JSON-RPC
//! bodies.
//!
//! Both decoders are incremental: stream chunks may split a message at any
//! byte offset, and one chunk may carry several complete messages
//! back-to-back.

use serde_json::Value;
use tracing::error;

// ─── NUL-delimited protocol ───────────────────────────────────────────────────

/// Incremental splitter for NUL-terminated responses.
#[derive(Debug, Default)]
pub struct NulDecoder {
    buf: Vec<u8>,
}

impl NulDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every response completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == 0) {
            let rest = self.buf.split_off(pos + 1);
            self.buf.pop(); // drop the NUL terminator
            out.push(String::from_utf8_lossy(&self.buf).into_owned());
            self.buf = rest;
        }
        out
    }

    /// Drop any partially accumulated response.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Encode a command as a JSON array of arguments followed by a NUL byte.
pub fn encode_nul_command(args: &[String]) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(args).expect("string array serializes");
    bytes.push(0);
    bytes
}

// ─── Content-Length framing ───────────────────────────────────────────────────

/// Incremental parser for `Content-Length`-framed JSON messages.
#[derive(Debug, Default)]
pub struct HeaderDecoder {
    buf: Vec<u8>,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every complete message it finishes, in order.
    ///
    /// A malformed header clears the buffer (there is no way to resync);
    /// a body that is not valid JSON is logged and skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            let Some(header_end) = find_subslice(&self.buf, b"\r\n\r\n") else {
                break;
            };
            let header = String::from_utf8_lossy(&self.buf[..header_end]).into_owned();
            let Some(content_length) = parse_content_length(&header) else {
                error!(header = %header, "invalid protocol header, dropping buffer");
                self.buf.clear();
                break;
            };
            let body_start = header_end + 4;
            let body_end = body_start + content_length;
            if self.buf.len() < body_end {
                break; // body not fully arrived yet
            }
            let body = &self.buf[body_start..body_end];
            match serde_json::from_slice::<Value>(body) {
                Ok(value) => out.push(value),
                Err(err) => {
                    error!(%err, "failed to parse framed JSON message, skipping");
                }
            }
            self.buf.drain(..body_end);
        }
        out
    }
}

/// Encode a JSON-serializable message with a `Content-Length` header.
pub fn encode_frame<T: serde::Serialize>(message: &T) -> Vec<u8> {
    let body = serde_json::to_vec(message).expect("message serializes");
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    frame
}

fn parse_content_length(header: &str) -> Option<usize> {
    header.lines().find_map(|line| {
        let rest = line.strip_prefix("Content-Length:")?;
        rest.trim().parse().ok()
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nul_decoder_single_response() {
        let mut dec = NulDecoder::new();
        assert!(dec.push(b"{\"result\":\"ok\"}").is_empty());
        let out = dec.push(b"\0");
        assert_eq!(out, vec!["{\"result\":\"ok\"}"]);
    }

    #[test]
    fn nul_decoder_multiple_responses_one_chunk() {
        let mut dec = NulDecoder::new();
        let out = dec.push(b"first\0second\0par");
        assert_eq!(out, vec!["first", "second"]);
        let out = dec.push(b"tial\0");
        assert_eq!(out, vec!["partial"]);
    }

    #[test]
    fn nul_decoder_single_byte_chunks() {
        let mut dec = NulDecoder::new();
        let mut got = Vec::new();
        for byte in b"one\0two\0" {
            got.extend(dec.push(&[*byte]));
        }
        assert_eq!(got, vec!["one", "two"]);
    }

    #[test]
    fn nul_decoder_empty_response() {
        let mut dec = NulDecoder::new();
        assert_eq!(dec.push(b"\0"), vec![String::new()]);
    }

    #[test]
    fn nul_command_encoding() {
        let args = vec!["resolve".to_string(), "qlpacks".to_string()];
        let bytes = encode_nul_command(&args);
        assert_eq!(&bytes[..bytes.len() - 1], br#"["resolve","qlpacks"]"#);
        assert_eq!(*bytes.last().unwrap(), 0);
    }

    #[test]
    fn header_decoder_whole_frame() {
        let mut dec = HeaderDecoder::new();
        let frame = encode_frame(&json!({"jsonrpc":"2.0","id":1,"result":{}}));
        let out = dec.push(&frame);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], 1);
    }

    #[test]
    fn header_decoder_split_at_every_offset() {
        let frame = encode_frame(&json!({
            "jsonrpc": "2.0",
            "id": 42,
            "result": {"answer": "деterministic"}
        }));
        for split in 1..frame.len() {
            let mut dec = HeaderDecoder::new();
            let mut out = dec.push(&frame[..split]);
            out.extend(dec.push(&frame[split..]));
            assert_eq!(out.len(), 1, "split at {split}");
            assert_eq!(out[0]["id"], 42, "split at {split}");
        }
    }

    #[test]
    fn header_decoder_two_frames_one_chunk() {
        let mut chunk = encode_frame(&json!({"id": 1}));
        chunk.extend(encode_frame(&json!({"id": 2})));
        let mut dec = HeaderDecoder::new();
        let out = dec.push(&chunk);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["id"], 1);
        assert_eq!(out[1]["id"], 2);
    }

    #[test]
    fn header_decoder_invalid_header_drops_buffer() {
        let mut dec = HeaderDecoder::new();
        let out = dec.push(b"Bogus-Header: 12\r\n\r\nxxxx");
        assert!(out.is_empty());
        // A well-formed frame afterwards still parses.
        let out = dec.push(&encode_frame(&json!({"id": 3})));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn header_decoder_invalid_json_body_skipped() {
        let mut dec = HeaderDecoder::new();
        let mut chunk = b"Content-Length: 4\r\n\r\nnope".to_vec();
        chunk.extend(encode_frame(&json!({"id": 7})));
        let out = dec.push(&chunk);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["id"], 7);
    }

    #[test]
    fn content_length_counts_bytes_not_chars() {
        // Multi-byte UTF-8 in the body must frame by byte length.
        let frame = encode_frame(&json!({"msg": "héllo"}));
        let mut dec = HeaderDecoder::new();
        let out = dec.push(&frame);
        assert_eq!(out[0]["msg"], "héllo");
    }
}
