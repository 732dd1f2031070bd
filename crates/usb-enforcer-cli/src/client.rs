//! Blocking clients for the daemon's two sockets.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use usb_enforcer_core::channel::{self, ChannelReply, MAX_FRAME_LEN};
use usb_enforcer_core::service::protocol::{read_message_blocking, write_message_blocking};
use usb_enforcer_core::{ApiRequest, ApiResponse, OperationKind};

const SECRETS_TIMEOUT: Duration = Duration::from_secs(10);

/// One Remote API connection.
pub struct ApiClient {
    stream: UnixStream,
}

impl ApiClient {
    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .with_context(|| format!("connect to remote API at {}", path.display()))?;
        Ok(Self { stream })
    }

    pub fn call(&mut self, request: &ApiRequest) -> Result<ApiResponse> {
        write_message_blocking(&mut self.stream, request)?;
        self.recv()
    }

    /// Next message from the daemon; used to follow a subscription.
    pub fn recv(&mut self) -> Result<ApiResponse> {
        Ok(read_message_blocking(&mut self.stream)?)
    }

    /// Turn this connection into an event stream.
    pub fn subscribe(mut self) -> Result<Self> {
        match self.call(&ApiRequest::Subscribe)? {
            ApiResponse::Subscribed => Ok(self),
            other => bail!("daemon refused subscription: {}", describe_failure(&other)),
        }
    }
}

/// Hand `passphrase` to the Secrets Channel and return the token id.
pub fn submit_secret(
    path: &Path,
    device: &str,
    kind: OperationKind,
    passphrase: &[u8],
) -> Result<String> {
    let mut stream = UnixStream::connect(path)
        .with_context(|| format!("connect to secrets channel at {}", path.display()))?;
    stream.set_read_timeout(Some(SECRETS_TIMEOUT))?;

    let frame = channel::encode_submission(device, kind, passphrase)?;
    stream.write_all(&frame)?;
    stream.flush()?;
    drop(frame);

    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .context("secrets channel closed without a reply")?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        bail!("secrets channel reply of {len} bytes is too large");
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;

    match channel::decode_reply(&body)? {
        ChannelReply::Token(token) => Ok(token),
        ChannelReply::Rejected(reason) => bail!("passphrase rejected: {reason}"),
    }
}

/// Human-readable text for an unexpected or error response.
pub fn describe_failure(response: &ApiResponse) -> String {
    match response {
        ApiResponse::Error { kind, message } => {
            let kind = serde_json::to_value(kind)
                .ok()
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{kind:?}"));
            format!("{message} ({kind})")
        }
        other => format!("unexpected response {other:?}"),
    }
}
