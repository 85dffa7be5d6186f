//! Test-only backend message serializer.
use bytes::{BufMut, Bytes, BytesMut};

use super::Oid;
use crate::ext::BufMutExt;

/// A backend frame under construction.
#[derive(Debug, Clone)]
pub struct Frame {
    msgtype: u8,
    body: BytesMut,
}

impl Frame {
    pub fn new(msgtype: u8) -> Self {
        Self { msgtype, body: BytesMut::new() }
    }

    pub fn u8(mut self, v: u8) -> Self {
        self.body.put_u8(v);
        self
    }

    pub fn u16(mut self, v: u16) -> Self {
        self.body.put_u16(v);
        self
    }

    pub fn i32(mut self, v: i32) -> Self {
        self.body.put_i32(v);
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.body.put_u32(v);
        self
    }

    pub fn bytes(mut self, v: &[u8]) -> Self {
        self.body.put_slice(v);
        self
    }

    pub fn cstr(mut self, v: &str) -> Self {
        self.body.put_nul_string(v);
        self
    }

    pub fn into_parts(self) -> (u8, Bytes) {
        (self.msgtype, self.body.freeze())
    }

    /// Tag, length and body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.body.len() + 5);
        buf.put_u8(self.msgtype);
        buf.put_u32(self.body.len() as u32 + 4);
        buf.put_slice(&self.body);
        buf
    }

    pub fn auth_ok() -> Self {
        Self::new(b'R').u32(0)
    }

    pub fn cleartext() -> Self {
        Self::new(b'R').u32(3)
    }

    pub fn md5(salt: [u8; 4]) -> Self {
        Self::new(b'R').u32(5).bytes(&salt)
    }

    pub fn sasl(mechanisms: &[&str]) -> Self {
        let mut frame = Self::new(b'R').u32(10);
        for m in mechanisms {
            frame = frame.cstr(m);
        }
        frame.u8(0)
    }

    pub fn sasl_continue(data: &[u8]) -> Self {
        Self::new(b'R').u32(11).bytes(data)
    }

    pub fn sasl_final(data: &[u8]) -> Self {
        Self::new(b'R').u32(12).bytes(data)
    }

    pub fn backend_key(process_id: u32, secret_key: u32) -> Self {
        Self::new(b'K').u32(process_id).u32(secret_key)
    }

    pub fn parameter_status(name: &str, value: &str) -> Self {
        Self::new(b'S').cstr(name).cstr(value)
    }

    pub fn ready(status: u8) -> Self {
        Self::new(b'Z').u8(status)
    }

    pub fn row_description(fields: &[(&str, Oid)]) -> Self {
        let mut frame = Self::new(b'T').u16(fields.len() as u16);
        for &(name, oid) in fields {
            frame = frame.cstr(name).u32(0).bytes(&0i16.to_be_bytes()).u32(oid);
            frame = frame.bytes(&(-1i16).to_be_bytes()).i32(-1).u16(0);
        }
        frame
    }

    pub fn data_row(values: &[Option<&str>]) -> Self {
        let mut frame = Self::new(b'D').u16(values.len() as u16);
        for value in values {
            frame = match value {
                Some(v) => frame.i32(v.len() as i32).bytes(v.as_bytes()),
                None => frame.i32(-1),
            };
        }
        frame
    }

    pub fn command_complete(tag: &str) -> Self {
        Self::new(b'C').cstr(tag)
    }

    pub fn error(fields: &[(u8, &str)]) -> Self {
        Self::fields(b'E', fields)
    }

    pub fn notice(fields: &[(u8, &str)]) -> Self {
        Self::fields(b'N', fields)
    }

    fn fields(msgtype: u8, fields: &[(u8, &str)]) -> Self {
        let mut frame = Self::new(msgtype);
        for &(code, value) in fields {
            frame = frame.u8(code).cstr(value);
        }
        frame.u8(0)
    }

    pub fn notification(process_id: u32, channel: &str, payload: &str) -> Self {
        Self::new(b'A').u32(process_id).cstr(channel).cstr(payload)
    }

    pub fn copy_in(columns: u16) -> Self {
        let mut frame = Self::new(b'G').u8(0).u16(columns);
        for _ in 0..columns {
            frame = frame.u16(0);
        }
        frame
    }

    pub fn parse_complete() -> Self {
        Self::new(b'1')
    }

    pub fn bind_complete() -> Self {
        Self::new(b'2')
    }

    pub fn close_complete() -> Self {
        Self::new(b'3')
    }

    pub fn no_data() -> Self {
        Self::new(b'n')
    }

    pub fn portal_suspended() -> Self {
        Self::new(b's')
    }

    pub fn empty_query() -> Self {
        Self::new(b'I')
    }
}

/// Concatenate encoded frames.
pub fn frames(frames: &[Frame]) -> Vec<u8> {
    frames.iter().flat_map(Frame::encode).collect()
}

/// Split outbound frontend bytes into `(tag, body)` pairs.
///
/// Untagged messages are not supported, strip them first.
pub fn split_frontend(mut buf: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = vec![];
    while !buf.is_empty() {
        let tag = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        out.push((tag, buf[5..1 + len].to_vec()));
        buf = &buf[1 + len..];
    }
    out
}

/// Tags of [`split_frontend`] output.
pub fn frontend_tags(buf: &[u8]) -> Vec<u8> {
    split_frontend(buf).into_iter().map(|(tag, _)| tag).collect()
}

/// Read the untagged startup message, returns its body after the length.
#[cfg(feature = "tokio")]
pub async fn read_startup<R: tokio::io::AsyncRead + Unpin>(io: &mut R) -> Vec<u8> {
    use tokio::io::AsyncReadExt;
    let len = io.read_u32().await.unwrap() as usize;
    let mut body = vec![0; len - 4];
    io.read_exact(&mut body).await.unwrap();
    body
}

/// Read one tagged frontend message.
#[cfg(feature = "tokio")]
pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(io: &mut R) -> (u8, Vec<u8>) {
    use tokio::io::AsyncReadExt;
    let tag = io.read_u8().await.unwrap();
    let len = io.read_u32().await.unwrap() as usize;
    let mut body = vec![0; len - 4];
    io.read_exact(&mut body).await.unwrap();
    (tag, body)
}
