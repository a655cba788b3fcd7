//! Netstring-style length-prefixed framing: `<digits>:<payload>,`.
//!
//! The decoder never buffers more than the declared payload length plus the
//! small fixed header, and enforces both an 8-digit header cap and a 10 MiB
//! payload cap independently (the tighter one wins regardless of which is
//! hit first).

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard upper bound on a single payload, in bytes (10 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Maximum number of ASCII decimal digits accepted in the length header.
const MAX_HEADER_DIGITS: usize = 8;

#[derive(Debug)]
pub enum FrameError {
    /// Stream ended cleanly exactly at a frame boundary — not a single
    /// header digit had been read yet. Distinct from [`FrameError::Truncated`],
    /// which means a frame was in progress when the stream ended.
    Eof,
    /// Header digits missing, non-digit before `:`, more than 8 digits, or a
    /// bad separator byte where one was actually read.
    Malformed,
    /// Declared length exceeds [`MAX_PAYLOAD_BYTES`].
    TooLarge,
    /// Stream ended while content or the trailing `,` was still expected.
    Truncated,
    /// Anything else (the underlying transport failed).
    Io(std::io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Eof => write!(f, "stream closed at frame boundary"),
            FrameError::Malformed => write!(f, "malformed frame header"),
            FrameError::TooLarge => write!(f, "frame payload exceeds 10 MiB"),
            FrameError::Truncated => write!(f, "frame truncated before completion"),
            FrameError::Io(e) => write!(f, "frame io error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Encodes `payload` as `"<len>:<payload>,"`. Errors if `payload` exceeds
/// [`MAX_PAYLOAD_BYTES`] — callers on the outbound path are expected to have
/// already checked this, but we don't trust that blindly.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(FrameError::TooLarge);
    }
    let mut buf = Vec::with_capacity(payload.len() + 10);
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(payload);
    buf.push(b',');
    Ok(buf)
}

/// Reads exactly one frame from `reader`, returning the payload bytes.
///
/// Never allocates more than `n + O(1)` bytes, where `n` is the declared
/// length — the buffer for the content is allocated only after the header
/// has been validated against both size caps.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut digits: Vec<u8> = Vec::with_capacity(MAX_HEADER_DIGITS);
    loop {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if digits.is_empty() {
                return Err(FrameError::Eof);
            }
            return Err(FrameError::Truncated);
        }
        if byte[0] == b':' {
            break;
        }
        if !byte[0].is_ascii_digit() {
            return Err(FrameError::Malformed);
        }
        digits.push(byte[0]);
        if digits.len() > MAX_HEADER_DIGITS {
            return Err(FrameError::Malformed);
        }
    }
    if digits.is_empty() {
        return Err(FrameError::Malformed);
    }

    let header = std::str::from_utf8(&digits).map_err(|_| FrameError::Malformed)?;
    let n: usize = header.parse().map_err(|_| FrameError::Malformed)?;
    if n > MAX_PAYLOAD_BYTES {
        return Err(FrameError::TooLarge);
    }

    let mut payload = vec![0u8; n];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Truncated
        } else {
            FrameError::Io(e)
        }
    })?;

    let mut sep = [0u8; 1];
    let n = reader.read(&mut sep).await?;
    if n == 0 {
        return Err(FrameError::Truncated);
    }
    if sep[0] != b',' {
        return Err(FrameError::Malformed);
    }

    Ok(payload)
}

/// Incremental, cancel-safe counterpart to [`read_frame`] for use inside a
/// `tokio::select!` branch that may be cancelled mid-read (e.g. because the
/// X side became readable first). All progress is kept in `self` rather
/// than in the async fn's stack, and every individual I/O step is a single
/// `AsyncReadExt::read` call, which tokio documents as cancel safe.
#[derive(Debug)]
pub struct FrameReader {
    header: Vec<u8>,
    header_done: bool,
    declared_len: usize,
    body: Vec<u8>,
    awaiting_separator: bool,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            header: Vec::with_capacity(MAX_HEADER_DIGITS),
            header_done: false,
            declared_len: 0,
            body: Vec::new(),
            awaiting_separator: false,
        }
    }

    fn reset(&mut self) {
        self.header.clear();
        self.header_done = false;
        self.declared_len = 0;
        self.body.clear();
        self.awaiting_separator = false;
    }

    /// Reads and returns the next complete frame. Safe to drop and re-call
    /// (e.g. from a `select!` loop) between any two awaits.
    pub async fn next_frame<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<Vec<u8>, FrameError> {
        loop {
            if self.awaiting_separator {
                let mut b = [0u8; 1];
                let n = reader.read(&mut b).await?;
                if n == 0 {
                    self.reset();
                    return Err(FrameError::Truncated);
                }
                self.awaiting_separator = false;
                if b[0] != b',' {
                    self.reset();
                    return Err(FrameError::Malformed);
                }
                let payload = std::mem::take(&mut self.body);
                self.reset();
                return Ok(payload);
            }

            if !self.header_done {
                let mut b = [0u8; 1];
                let n = reader.read(&mut b).await?;
                if n == 0 {
                    let at_boundary = self.header.is_empty();
                    self.reset();
                    return Err(if at_boundary { FrameError::Eof } else { FrameError::Truncated });
                }
                if b[0] == b':' {
                    if self.header.is_empty() {
                        self.reset();
                        return Err(FrameError::Malformed);
                    }
                    let s = match std::str::from_utf8(&self.header) {
                        Ok(s) => s,
                        Err(_) => {
                            self.reset();
                            return Err(FrameError::Malformed);
                        }
                    };
                    let declared: usize = match s.parse() {
                        Ok(v) => v,
                        Err(_) => {
                            self.reset();
                            return Err(FrameError::Malformed);
                        }
                    };
                    if declared > MAX_PAYLOAD_BYTES {
                        self.reset();
                        return Err(FrameError::TooLarge);
                    }
                    self.declared_len = declared;
                    self.header_done = true;
                    self.body = Vec::with_capacity(declared);
                    continue;
                }
                if !b[0].is_ascii_digit() {
                    self.reset();
                    return Err(FrameError::Malformed);
                }
                self.header.push(b[0]);
                if self.header.len() > MAX_HEADER_DIGITS {
                    self.reset();
                    return Err(FrameError::Malformed);
                }
                continue;
            }

            if self.body.len() < self.declared_len {
                let want = self.declared_len - self.body.len();
                let mut chunk = vec![0u8; want];
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    self.reset();
                    return Err(FrameError::Truncated);
                }
                self.body.extend_from_slice(&chunk[..n]);
                continue;
            }

            self.awaiting_separator = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn decode(bytes: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut cur = Cursor::new(bytes.to_vec());
        read_frame(&mut cur).await
    }

    #[tokio::test]
    async fn round_trip() {
        let framed = encode(b"Hello world!").unwrap();
        assert_eq!(framed, b"12:Hello world!,");
        let back = decode(&framed).await.unwrap();
        assert_eq!(back, b"Hello world!");
    }

    #[tokio::test]
    async fn truncated_content() {
        assert!(matches!(decode(b"5:Hell").await, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn truncated_missing_separator() {
        assert!(matches!(decode(b"5:Hello").await, Err(FrameError::Truncated)));
    }

    #[tokio::test]
    async fn clean_eof_at_frame_boundary() {
        assert!(matches!(decode(b"").await, Err(FrameError::Eof)));

        let mut fr = FrameReader::new();
        let mut cur = Cursor::new(Vec::new());
        assert!(matches!(fr.next_frame(&mut cur).await, Err(FrameError::Eof)));
    }

    #[tokio::test]
    async fn malformed_wrong_separator() {
        assert!(matches!(decode(b"5:Hello.").await, Err(FrameError::Malformed)));
    }

    #[tokio::test]
    async fn malformed_header_too_many_digits() {
        let mut frame = b"123456789:".to_vec();
        frame.extend(std::iter::repeat(b'a').take(9));
        frame.push(b',');
        assert!(matches!(decode(&frame).await, Err(FrameError::Malformed)));
    }

    #[tokio::test]
    async fn malformed_no_digits() {
        assert!(matches!(decode(b":x,").await, Err(FrameError::Malformed)));
    }

    #[tokio::test]
    async fn malformed_non_digit_before_colon() {
        assert!(matches!(decode(b"1x:a,").await, Err(FrameError::Malformed)));
    }

    #[tokio::test]
    async fn too_large_payload() {
        let header = format!("{}:", MAX_PAYLOAD_BYTES + 1);
        let mut frame = header.into_bytes();
        frame.extend(std::iter::repeat(b'a').take(1));
        assert!(matches!(decode(&frame).await, Err(FrameError::TooLarge)));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let oversized = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert!(matches!(encode(&oversized), Err(FrameError::TooLarge)));
    }

    #[tokio::test]
    async fn empty_payload_round_trips() {
        let framed = encode(b"").unwrap();
        assert_eq!(framed, b"0:,");
        assert_eq!(decode(&framed).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn frame_reader_matches_read_frame() {
        let framed = encode(b"hello again").unwrap();
        let mut cur = Cursor::new(framed);
        let mut fr = FrameReader::new();
        let payload = fr.next_frame(&mut cur).await.unwrap();
        assert_eq!(payload, b"hello again");
    }

    #[tokio::test]
    async fn frame_reader_is_cancel_safe_across_select() {
        use tokio::io::AsyncWriteExt;

        let (mut client, mut server) = tokio::io::duplex(64);
        let mut fr = FrameReader::new();

        client.write_all(b"7:resu").await.unwrap();

        // next_frame needs 3 more body bytes that haven't arrived yet; race
        // it against a timer so it gets cancelled mid-read. No bytes must
        // be lost from what it already consumed.
        tokio::select! {
            _ = fr.next_frame(&mut server) => panic!("should not complete without full frame"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }

        client.write_all(b"med,").await.unwrap();
        let payload = fr.next_frame(&mut server).await.unwrap();
        assert_eq!(payload, b"resumed");
    }

    #[tokio::test]
    async fn frame_reader_reports_same_errors_as_read_frame() {
        let mut cur = Cursor::new(b"5:Hello".to_vec());
        let mut fr = FrameReader::new();
        assert!(matches!(fr.next_frame(&mut cur).await, Err(FrameError::Truncated)));

        let mut cur = Cursor::new(b"5:Hello.".to_vec());
        let mut fr = FrameReader::new();
        assert!(matches!(fr.next_frame(&mut cur).await, Err(FrameError::Malformed)));
    }
}
