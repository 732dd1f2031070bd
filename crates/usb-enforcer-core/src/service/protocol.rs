//! Remote API wire protocol.
//!
//! JSON messages over a Unix socket, each preceded by a 4-byte big-endian
//! length. A `subscribe` request turns the connection into a one-way stream
//! of `event` responses.

use crate::crypto::EncryptOptions;
use crate::device::DeviceSummary;
use crate::error::{EnforcerError, EnforcerResult};
use crate::events::EnforcerEvent;
use crate::operation::OperationId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest message either side accepts.
pub const MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ApiRequest {
    ListDevices,
    GetDeviceStatus {
        path: String,
    },
    RequestUnlock {
        path: String,
        token: String,
    },
    RequestEncrypt {
        path: String,
        token: String,
        #[serde(default)]
        options: EncryptOptions,
    },
    Subscribe,
    Ping,
}

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Token,
    InProgress,
    Ineligible,
    Protocol,
    Internal,
}

impl ErrorKind {
    pub fn of(err: &EnforcerError) -> Self {
        match err {
            EnforcerError::DeviceNotFound(_) => ErrorKind::NotFound,
            EnforcerError::Token(_) => ErrorKind::Token,
            EnforcerError::OperationInProgress(_) => ErrorKind::InProgress,
            EnforcerError::Ineligible { .. } | EnforcerError::PassphraseTooShort { .. } => {
                ErrorKind::Ineligible
            }
            EnforcerError::ChannelProtocol(_) => ErrorKind::Protocol,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiResponse {
    Devices { devices: Vec<DeviceSummary> },
    Device { device: DeviceSummary },
    Operation { operation_id: OperationId },
    Subscribed,
    Event { event: EnforcerEvent },
    Pong { version: String },
    Error { kind: ErrorKind, message: String },
}

impl ApiResponse {
    pub fn error(err: &EnforcerError) -> Self {
        ApiResponse::Error {
            kind: ErrorKind::of(err),
            message: err.to_string(),
        }
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        ApiResponse::Error {
            kind: ErrorKind::Protocol,
            message: message.into(),
        }
    }
}

fn protocol(message: impl Into<String>) -> EnforcerError {
    EnforcerError::ChannelProtocol(message.into())
}

/// Serialize `message` with its length prefix.
pub fn encode<T: Serialize>(message: &T) -> EnforcerResult<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|err| protocol(format!("failed to encode message: {err}")))?;
    if body.len() > MAX_MESSAGE_LEN {
        return Err(protocol(format!("message of {} bytes is too large", body.len())));
    }
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> EnforcerResult<T> {
    serde_json::from_slice(body).map_err(|err| protocol(format!("malformed message: {err}")))
}

fn checked_len(header: [u8; 4]) -> EnforcerResult<usize> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(protocol(format!(
            "message of {len} bytes exceeds {MAX_MESSAGE_LEN}"
        )));
    }
    Ok(len)
}

/// Read one message; `Ok(None)` on a clean end of stream.
pub async fn read_message<R, T>(reader: &mut R) -> EnforcerResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = checked_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body).map(Some)
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> EnforcerResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocking counterpart of [`read_message`] for simple clients.
pub fn read_message_blocking<R: Read, T: DeserializeOwned>(reader: &mut R) -> EnforcerResult<T> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let len = checked_len(header)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    decode(&body)
}

pub fn write_message_blocking<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> EnforcerResult<()> {
    writer.write_all(&encode(message)?)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TokenError;
    use usb_enforcer_provider::FilesystemType;

    #[test]
    fn requests_use_method_tag() {
        let json = r#"{"method":"request_encrypt","path":"/dev/sdb1","token":"abc","options":{"filesystem_type":"exfat","preserve_data":true}}"#;
        let request: ApiRequest = serde_json::from_str(json).unwrap();
        match request {
            ApiRequest::RequestEncrypt { path, options, .. } => {
                assert_eq!(path, "/dev/sdb1");
                assert_eq!(options.filesystem_type, Some(FilesystemType::Exfat));
                assert!(options.preserve_data);
                assert!(!options.reformat_luks);
            }
            other => panic!("unexpected request {other:?}"),
        }

        let ping: ApiRequest = serde_json::from_str(r#"{"method":"ping"}"#).unwrap();
        assert_eq!(ping, ApiRequest::Ping);
    }

    #[test]
    fn options_default_when_omitted() {
        let json = r#"{"method":"request_encrypt","path":"/dev/sdb1","token":"abc"}"#;
        let request: ApiRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(
            request,
            ApiRequest::RequestEncrypt { options, .. } if options == EncryptOptions::default()
        ));
    }

    #[test]
    fn errors_map_to_kinds() {
        let cases = [
            (EnforcerError::DeviceNotFound("/dev/x".into()), ErrorKind::NotFound),
            (EnforcerError::Token(TokenError::Expired), ErrorKind::Token),
            (EnforcerError::OperationInProgress("/dev/x".into()), ErrorKind::InProgress),
            (EnforcerError::PassphraseTooShort { min: 12, got: 3 }, ErrorKind::Ineligible),
            (EnforcerError::Provider("boom".into()), ErrorKind::Internal),
        ];
        for (err, kind) in cases {
            assert_eq!(ErrorKind::of(&err), kind);
        }
    }

    #[test]
    fn blocking_frames_decode() {
        let frame = encode(&ApiResponse::Pong {
            version: "0.3.0".into(),
        })
        .unwrap();
        let mut cursor = std::io::Cursor::new(frame);
        let response: ApiResponse = read_message_blocking(&mut cursor).unwrap();
        assert_eq!(
            response,
            ApiResponse::Pong {
                version: "0.3.0".into()
            }
        );
    }

    #[tokio::test]
    async fn async_reader_reports_clean_eof() {
        let mut empty: &[u8] = &[];
        let message: Option<ApiRequest> = read_message(&mut empty).await.unwrap();
        assert!(message.is_none());
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let mut input: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        let err = read_message::<_, ApiRequest>(&mut input).await.unwrap_err();
        assert!(matches!(err, EnforcerError::ChannelProtocol(_)));
    }
}
