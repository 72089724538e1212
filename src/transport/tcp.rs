//! Raw TCP transport adapter for `tcp://` and `stomp://` endpoints

use super::{
    classify_io_error, LinkEndpoint, Outgoing, Transport, TransportError, TransportEvent,
    TransportLink,
};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};
use url::Url;

/// Default STOMP port when the endpoint omits one
pub const DEFAULT_PORT: u16 = 61613;

const READ_BUFFER_BYTES: usize = 8 * 1024;

/// Opens plain TCP links
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn open(&self, endpoint: &Url) -> Result<TransportLink, TransportError> {
        let (host, port) = socket_address(endpoint)?;
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| classify_io_error(&e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: "broker_transport", "Could not set TCP_NODELAY: {}", e);
        }
        info!(host = %host, port, "TCP transport connected");

        let (reader, writer) = stream.into_split();
        let (link, link_endpoint) = TransportLink::pair();
        tokio::spawn(pump(reader, writer, link_endpoint));
        Ok(link)
    }
}

fn socket_address(endpoint: &Url) -> Result<(String, u16), TransportError> {
    if !matches!(endpoint.scheme(), "tcp" | "stomp") {
        return Err(TransportError::UnsupportedEndpoint(endpoint.scheme().to_string()));
    }
    let host = endpoint
        .host_str()
        .ok_or_else(|| TransportError::UnsupportedEndpoint(format!("{endpoint} has no host")))?;
    Ok((host.to_string(), endpoint.port().unwrap_or(DEFAULT_PORT)))
}

async fn pump(mut reader: OwnedReadHalf, mut writer: OwnedWriteHalf, mut endpoint: LinkEndpoint) {
    let mut buf = vec![0u8; READ_BUFFER_BYTES];

    loop {
        tokio::select! {
            outgoing = endpoint.outgoing.recv() => match outgoing {
                Some(Outgoing::Data(bytes)) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        endpoint.emit(TransportEvent::Error(classify_io_error(&e)));
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = writer.shutdown().await;
                    debug!(target: "broker_transport", "TCP link closed by session");
                    break;
                }
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    endpoint.emit(TransportEvent::Closed(None));
                    break;
                }
                Ok(n) => {
                    if !endpoint.emit(TransportEvent::Data(Bytes::copy_from_slice(&buf[..n]))) {
                        break;
                    }
                }
                Err(e) => {
                    endpoint.emit(TransportEvent::Error(classify_io_error(&e)));
                    break;
                }
            }
        }
    }
}
