//! Remote API listener.
//!
//! Request/response over one connection until the client hangs up, except
//! `subscribe`, which turns the connection into an event stream.

use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::UnixListener;
use tokio::sync::broadcast::error::RecvError;
use usb_enforcer_core::service::protocol::{read_message, write_message};
use usb_enforcer_core::{
    ApiRequest, ApiResponse, EnforcerError, EnforcerService, ErrorKind, Platform,
};

pub async fn serve<P: Platform>(listener: UnixListener, service: EnforcerService<P>) -> anyhow::Result<()> {
    info!("remote API accepting connections");
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!("remote API accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, service).await {
                debug!("API connection ended: {err}");
            }
        });
    }
}

pub(crate) async fn handle_connection<S, P>(
    stream: S,
    service: EnforcerService<P>,
) -> Result<(), EnforcerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Platform,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    loop {
        let request = match read_message::<_, ApiRequest>(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(err @ EnforcerError::ChannelProtocol(_)) => {
                let _ = write_message(&mut writer, &ApiResponse::protocol_error(err.to_string())).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        if request == ApiRequest::Subscribe {
            return stream_events(writer, &service).await;
        }

        let worker = service.clone();
        let response = tokio::task::spawn_blocking(move || worker.handle(request))
            .await
            .unwrap_or_else(|err| ApiResponse::Error {
                kind: ErrorKind::Internal,
                message: format!("request handler failed: {err}"),
            });
        write_message(&mut writer, &response).await?;
    }
}

async fn stream_events<S, P>(
    mut writer: WriteHalf<S>,
    service: &EnforcerService<P>,
) -> Result<(), EnforcerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Platform,
{
    let mut events = service.subscribe();
    write_message(&mut writer, &ApiResponse::Subscribed).await?;
    loop {
        match events.recv().await {
            Ok(event) => write_message(&mut writer, &ApiResponse::Event { event }).await?,
            Err(RecvError::Lagged(skipped)) => {
                warn!("event subscriber fell behind; {skipped} events dropped");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}
