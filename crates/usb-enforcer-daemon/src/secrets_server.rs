//! Secrets Channel listener: one passphrase in, one token out, per connection.

use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use usb_enforcer_core::channel::{self, ChannelReply};
use usb_enforcer_core::{EnforcerError, EnforcerService, Platform};

pub async fn serve<P: Platform>(listener: UnixListener, service: EnforcerService<P>) -> anyhow::Result<()> {
    info!("secrets channel accepting connections");
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!("secrets channel accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, &service).await {
                debug!("secrets connection dropped: {err}");
            }
        });
    }
}

/// Serve a single exchange. Malformed frames close the connection unanswered.
pub(crate) async fn handle_connection<S, P>(
    mut stream: S,
    service: &EnforcerService<P>,
) -> Result<(), EnforcerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Platform,
{
    let body = channel::read_frame_timeout(&mut stream).await?;
    let submission = channel::decode_submission(&body)?;
    drop(body);

    let reply = match service.submit_secret(submission) {
        Ok(token) => ChannelReply::Token(token),
        Err(err) => {
            info!("passphrase submission refused: {err}");
            ChannelReply::Rejected(err.to_string())
        }
    };
    channel::write_frame(&mut stream, &channel::encode_reply(&reply)?).await?;
    stream.shutdown().await?;
    Ok(())
}
