//! `Content-Length`-framed DAP message codec.
//!
//! DAP frames a message as one or more `Header: value\r\n` lines, a
//! blank `\r\n`, then a body of exactly `Content-Length` bytes holding
//! one UTF-8 JSON object. Only `Content-Length` is interpreted; other
//! headers are skipped. Header name comparison is case-insensitive.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

const CONTENT_LENGTH_HEADER: &str = "content-length";

#[derive(Debug)]
pub enum CodecError {
    /// Clean end of stream while reading headers (no partial frame started).
    Eof,
    /// Stream ended or failed while a frame was already in progress.
    Framing(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eof => write!(f, "end of stream"),
            Self::Framing(msg) => write!(f, "framing error: {msg}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Reads one framed DAP message from `reader`.
///
/// Returns [`CodecError::Eof`] only when the stream ends cleanly before
/// any header bytes were read (i.e. between messages). Any EOF or short
/// read once a `Content-Length` header has been seen is a framing error.
pub async fn read_message<R>(reader: &mut BufReader<R>) -> Result<Value, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_any_header_line = false;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if saw_any_header_line {
                return Err(CodecError::Framing(
                    "stream ended while reading headers".to_string(),
                ));
            }
            return Err(CodecError::Eof);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        saw_any_header_line = true;

        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH_HEADER) {
                let parsed = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| CodecError::Framing(format!("invalid Content-Length: {e}")))?;
                content_length = Some(parsed);
            }
        }
    }

    let length = content_length
        .ok_or_else(|| CodecError::Framing("missing Content-Length header".to_string()))?;

    let mut body = vec![0u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| CodecError::Framing(format!("short body read: {e}")))?;

    let value: Value = serde_json::from_slice(&body)?;
    Ok(value)
}

/// Serializes `message` and writes it framed to `writer` in one call,
/// so concurrent writers never interleave header and body bytes.
pub async fn write_message<W>(writer: &mut W, message: &Value) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn round_trips_a_message() {
        let mut buf: Vec<u8> = Vec::new();
        let msg = json!({"seq": 1, "type": "request", "command": "initialize"});
        write_message(&mut buf, &msg).await.unwrap();

        let mut reader = BufReader::new(buf.as_slice());
        let decoded = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive() {
        let body = br#"{"seq":1,"type":"event","event":"initialized"}"#;
        let mut raw = format!("content-LENGTH: {}\r\n\r\n", body.len()).into_bytes();
        raw.extend_from_slice(body);

        let mut reader = BufReader::new(raw.as_slice());
        let decoded = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded["event"], "initialized");
    }

    #[tokio::test]
    async fn clean_eof_between_messages_is_eof() {
        let mut reader = BufReader::new(&b""[..]);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::Eof));
    }

    #[tokio::test]
    async fn truncated_body_is_a_framing_error() {
        let raw = b"Content-Length: 50\r\n\r\n{\"seq\":1}";
        let mut reader = BufReader::new(&raw[..]);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::Framing(_)));
    }

    #[tokio::test]
    async fn missing_content_length_is_a_framing_error() {
        let raw = b"X-Custom: 1\r\n\r\n";
        let mut reader = BufReader::new(&raw[..]);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::Framing(_)));
    }
}
