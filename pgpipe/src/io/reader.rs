//! Incremental backend message framing.
use bytes::{Buf, BytesMut};

use crate::postgres::{BackendMessage, BackendProtocol, ProtocolError};

/// Capacity allocated up front.
pub const DEFAULT_CAPACITY: usize = 8 * 1024;

/// Spare capacity requested before each socket read.
pub const READ_CHUNK: usize = 4 * 1024;

/// Tag plus length.
const HEADER_LEN: usize = 5;

/// Largest accepted length field, the server never allocates more for one message.
pub const MAX_FRAME_LEN: i32 = 1 << 30;

/// Turns an append-only byte stream into backend messages.
///
/// Bytes are appended at the write end, and complete frames are split off the read end.
/// A partial trailing frame stays buffered until the rest of it arrives.
///
/// Decoded messages are zero copy slices of the same allocation.
/// The allocation is only reused in place once no live message refers to it.
#[derive(Debug)]
pub struct MessageReader {
    buf: BytesMut,
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageReader {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity) }
    }

    /// Append `bytes` and return the lazy sequence of complete messages now available.
    pub fn feed(&mut self, bytes: &[u8]) -> Messages<'_> {
        self.ensure_capacity(bytes.len());
        self.buf.extend_from_slice(bytes);
        self.messages()
    }

    /// Lazy sequence of complete messages in the buffer.
    ///
    /// The sequence ends when more bytes are needed, or after the first error.
    pub fn messages(&mut self) -> Messages<'_> {
        Messages { reader: self, failed: false }
    }

    /// Buffer to read from the socket into, with at least [`READ_CHUNK`] spare capacity.
    pub fn read_buf(&mut self) -> &mut BytesMut {
        self.ensure_capacity(READ_CHUNK);
        &mut self.buf
    }

    /// Number of unread buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Current allocation size measured from the read offset.
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Make room for `additional` bytes past the write offset.
    ///
    /// When the consumed region in front of the read offset is no longer referenced
    /// by any message and is at least as large as the unread tail, the tail is moved
    /// to the start of the allocation. Otherwise a new allocation of at least twice
    /// the size is made and only the unread tail is copied.
    pub fn ensure_capacity(&mut self, additional: usize) {
        if self.buf.capacity() - self.buf.len() >= additional {
            return;
        }
        self.buf.reserve(additional);
    }

    /// Decode the next complete message, `None` if more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>, ProtocolError> {
        self.decode()
    }

    /// Decode the next complete frame as `B`.
    pub fn decode<B: BackendProtocol>(&mut self) -> Result<Option<B>, ProtocolError> {
        let Some(header) = self.buf.get(..HEADER_LEN) else {
            return Ok(None);
        };

        let msgtype = header[0];
        let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);

        // length includes itself
        if !(4..=MAX_FRAME_LEN).contains(&len) {
            return Err(ProtocolError::InvalidLength { msgtype, len });
        }

        let frame_len = 1 + len as usize;
        if self.buf.len() < frame_len {
            self.ensure_capacity(frame_len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let body = self.buf.split_to(len as usize - 4).freeze();

        B::decode(msgtype, body).map(Some)
    }
}

/// Iterator of complete messages, see [`MessageReader::messages`].
#[derive(Debug)]
pub struct Messages<'a> {
    reader: &'a mut MessageReader,
    failed: bool,
}

impl Iterator for Messages<'_> {
    type Item = Result<BackendMessage, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.reader.next_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::testing::{Frame, frames};

    fn stream() -> (Vec<Frame>, Vec<u8>) {
        let list = vec![
            Frame::auth_ok(),
            Frame::parameter_status("server_version", "17.0"),
            Frame::backend_key(42, 7),
            Frame::ready(b'I'),
            Frame::row_description(&[("n", 23), ("s", 25)]),
            Frame::data_row(&[Some("1"), Some("hello")]),
            Frame::data_row(&[Some("2"), None]),
            Frame::new(b'!').bytes(b"unknown"),
            Frame::command_complete("SELECT 2"),
            Frame::ready(b'I'),
        ];
        let bytes = frames(&list);
        (list, bytes)
    }

    fn collect(reader: &mut MessageReader, chunk: &[u8], out: &mut Vec<BackendMessage>) {
        for message in reader.feed(chunk) {
            out.push(message.unwrap());
        }
    }

    #[test]
    fn any_chunking_yields_same_sequence() {
        let (list, bytes) = stream();
        let expect: Vec<u8> = list.iter().map(|f| f.clone().into_parts().0).collect();

        for chunk_size in [1, 2, 3, 5, 7, 64, bytes.len()] {
            let mut reader = MessageReader::with_capacity(16);
            let mut out = vec![];
            for chunk in bytes.chunks(chunk_size) {
                collect(&mut reader, chunk, &mut out);
            }
            let tags: Vec<u8> = out.iter().map(BackendMessage::msgtype).collect();
            assert_eq!(tags, expect, "chunk size {chunk_size}");
            assert_eq!(reader.buffered(), 0);

            let BackendMessage::DataRow(row) = &out[5] else { panic!("{:?}", out[5]) };
            assert_eq!(row.values[1].as_deref(), Some(&b"hello"[..]));
        }
    }

    #[test]
    fn partial_tail_is_retained() {
        let bytes = Frame::command_complete("INSERT 0 1").encode();
        let mut reader = MessageReader::new();

        assert!(reader.feed(&bytes[..3]).next().is_none());
        assert!(reader.feed(&bytes[3..bytes.len() - 1]).next().is_none());
        assert_eq!(reader.buffered(), bytes.len() - 1);

        let message = reader.feed(&bytes[bytes.len() - 1..]).next().unwrap().unwrap();
        let BackendMessage::CommandComplete(cmd) = message else { panic!("{message:?}") };
        assert_eq!(cmd.tag, "INSERT 0 1");
    }

    #[test]
    fn decoder_never_reads_past_frame() {
        // two frames back to back, the first one being a DataRow whose
        // declared field count is satisfied exactly
        let bytes = frames(&[Frame::data_row(&[Some("ab")]), Frame::ready(b'I')]);
        let mut reader = MessageReader::new();
        let out: Vec<_> = reader.feed(&bytes).collect::<Result<_, _>>().unwrap();
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1], BackendMessage::ReadyForQuery(_)));
    }

    #[test]
    fn invalid_length_is_fatal() {
        let mut reader = MessageReader::new();
        let mut messages = reader.feed(&[b'Z', 0, 0, 0, 3, b'I']);
        assert!(matches!(
            messages.next(),
            Some(Err(ProtocolError::InvalidLength { msgtype: b'Z', len: 3 })),
        ));
        assert!(messages.next().is_none());
    }

    #[test]
    fn oversized_length_is_rejected_before_buffering() {
        let mut reader = MessageReader::new();
        let mut header = vec![b'D'];
        header.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut messages = reader.feed(&header);
        assert!(matches!(
            messages.next(),
            Some(Err(ProtocolError::InvalidLength { msgtype: b'D', len })) if len == MAX_FRAME_LEN + 1,
        ));
        drop(messages);
        assert!(reader.capacity() < 1 << 20);
    }

    #[test]
    fn bounded_growth_under_partial_frames() {
        let frame = Frame::data_row(&[Some("0123456789"), Some("abcdefghij")]).encode();
        let mut reader = MessageReader::with_capacity(256);

        for _ in 0..2_000 {
            for byte in frame.chunks(1) {
                for message in reader.feed(byte) {
                    drop(message.unwrap());
                }
            }
        }

        assert_eq!(reader.buffered(), 0);
        assert!(reader.capacity() <= 512, "capacity grew to {}", reader.capacity());
    }

    #[test]
    fn large_frame_grows_buffer() {
        let big = "x".repeat(100_000);
        let bytes = Frame::data_row(&[Some(big.as_str())]).encode();
        let mut reader = MessageReader::with_capacity(64);
        let mut out = vec![];
        for chunk in bytes.chunks(4096) {
            collect(&mut reader, chunk, &mut out);
        }
        let BackendMessage::DataRow(row) = &out[0] else { panic!() };
        assert_eq!(row.values[0].as_ref().map(|v| v.len()), Some(100_000));
    }
}
