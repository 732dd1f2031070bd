//! Binary framing for the secrets channel.
//!
//! Request: `u32` BE body length, then `u16` BE path length + UTF-8 path,
//! `u8` operation kind, `u16` BE passphrase length + passphrase bytes.
//! Response: `u32` BE body length, then `u8` status (0 ok, 1 error), `u16` BE
//! length + UTF-8 token id or error text. One exchange per connection.

use crate::error::{EnforcerError, EnforcerResult};
use crate::operation::OperationKind;
use crate::secrets::SecretBytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

pub const MAX_FRAME_LEN: usize = 8 * 1024;
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Decoded passphrase submission.
#[derive(Debug)]
pub struct SecretSubmission {
    pub device: String,
    pub kind: OperationKind,
    pub passphrase: SecretBytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelReply {
    Token(String),
    Rejected(String),
}

fn protocol(message: impl Into<String>) -> EnforcerError {
    EnforcerError::ChannelProtocol(message.into())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> EnforcerResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| protocol(format!("truncated {what}")))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> EnforcerResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> EnforcerResult<u16> {
        let raw = self.take(2, what)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    fn finish(&self) -> EnforcerResult<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(protocol(format!(
                "{} trailing bytes after message",
                self.buf.len() - self.pos
            )))
        }
    }
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8], what: &str) -> EnforcerResult<()> {
    let len = u16::try_from(bytes.len()).map_err(|_| protocol(format!("{what} too long")))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn wrap_frame(body: &[u8]) -> EnforcerResult<Zeroizing<Vec<u8>>> {
    if body.len() > MAX_FRAME_LEN {
        return Err(protocol(format!(
            "frame of {} bytes exceeds {MAX_FRAME_LEN}",
            body.len()
        )));
    }
    let mut frame = Zeroizing::new(Vec::with_capacity(body.len() + 4));
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Parse a request body (without the length prefix).
pub fn decode_submission(body: &[u8]) -> EnforcerResult<SecretSubmission> {
    let mut cursor = Cursor::new(body);
    let path_len = cursor.u16("path length")? as usize;
    let path = cursor.take(path_len, "device path")?;
    let device = std::str::from_utf8(path)
        .map_err(|_| protocol("device path is not UTF-8"))?
        .to_string();
    if !device.starts_with('/') {
        return Err(protocol("device path must be absolute"));
    }
    let code = cursor.u8("operation kind")?;
    let kind = OperationKind::from_wire_code(code)
        .ok_or_else(|| protocol(format!("unknown operation kind {code}")))?;
    let secret_len = cursor.u16("passphrase length")? as usize;
    let secret = cursor.take(secret_len, "passphrase")?;
    cursor.finish()?;

    Ok(SecretSubmission {
        device,
        kind,
        passphrase: SecretBytes::from(secret),
    })
}

/// Build a complete request frame, length prefix included.
pub fn encode_submission(
    device: &str,
    kind: OperationKind,
    passphrase: &[u8],
) -> EnforcerResult<Zeroizing<Vec<u8>>> {
    let mut body = Zeroizing::new(Vec::with_capacity(device.len() + passphrase.len() + 5));
    push_field(&mut body, device.as_bytes(), "device path")?;
    body.push(kind.wire_code());
    push_field(&mut body, passphrase, "passphrase")?;
    wrap_frame(&body)
}

pub fn encode_reply(reply: &ChannelReply) -> EnforcerResult<Vec<u8>> {
    let (status, text) = match reply {
        ChannelReply::Token(id) => (STATUS_OK, id.as_str()),
        ChannelReply::Rejected(reason) => (STATUS_ERROR, reason.as_str()),
    };
    let mut body = Vec::with_capacity(text.len() + 3);
    body.push(status);
    push_field(&mut body, text.as_bytes(), "reply")?;
    Ok(wrap_frame(&body)?.to_vec())
}

pub fn decode_reply(body: &[u8]) -> EnforcerResult<ChannelReply> {
    let mut cursor = Cursor::new(body);
    let status = cursor.u8("status")?;
    let len = cursor.u16("reply length")? as usize;
    let text = std::str::from_utf8(cursor.take(len, "reply")?)
        .map_err(|_| protocol("reply is not UTF-8"))?
        .to_string();
    cursor.finish()?;
    match status {
        STATUS_OK => Ok(ChannelReply::Token(text)),
        STATUS_ERROR => Ok(ChannelReply::Rejected(text)),
        other => Err(protocol(format!("unknown reply status {other}"))),
    }
}

/// Read one length-prefixed frame body. The buffer is scrubbed on drop.
pub async fn read_frame<R>(reader: &mut R) -> EnforcerResult<Zeroizing<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(protocol("empty frame"));
    }
    if len > MAX_FRAME_LEN {
        return Err(protocol(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }
    let mut body = Zeroizing::new(vec![0u8; len]);
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// [`read_frame`] bounded by [`READ_TIMEOUT`].
pub async fn read_frame_timeout<R>(reader: &mut R) -> EnforcerResult<Zeroizing<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(READ_TIMEOUT, read_frame(reader))
        .await
        .map_err(|_| protocol("timed out waiting for request"))?
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> EnforcerResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
