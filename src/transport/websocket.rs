//! WebSocket transport adapter
//!
//! Frames travel as WebSocket text messages (binary when the payload is not
//! UTF-8). The adapter negotiates the `v12.stomp` subprotocol and never puts
//! credentials in the request; authentication happens in the CONNECT frame.

use super::{
    classify_io_error, LinkEndpoint, Outgoing, Transport, TransportError, TransportEvent,
    TransportLink,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBPROTOCOLS: &str = "v12.stomp, v11.stomp";

/// Opens links over `ws://` and `wss://` endpoints
#[derive(Debug, Clone)]
pub struct WebSocketTransport;

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        // wss:// needs a process-wide rustls provider; Err means one is already set
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, endpoint: &Url) -> Result<TransportLink, TransportError> {
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(TransportError::UnsupportedEndpoint(endpoint.scheme().to_string()));
        }

        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::UnsupportedEndpoint(e.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOLS),
        );

        let (ws_stream, response) = connect_async(request).await.map_err(classify_ws_error)?;
        info!(
            endpoint = %redact_endpoint(endpoint),
            status = %response.status(),
            "WebSocket transport connected"
        );

        let (link, link_endpoint) = TransportLink::pair();
        tokio::spawn(pump(ws_stream, link_endpoint));
        Ok(link)
    }
}

/// Shuttle bytes between the socket and the session until either side closes
async fn pump(ws_stream: WsStream, mut endpoint: LinkEndpoint) {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = endpoint.outgoing.recv() => match outgoing {
                Some(Outgoing::Data(bytes)) => {
                    if let Err(e) = sink.send(to_message(bytes)).await {
                        endpoint.emit(TransportEvent::Error(classify_ws_error(e)));
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    debug!(target: "broker_transport", "WebSocket closed by session");
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !endpoint.emit(TransportEvent::Data(Bytes::copy_from_slice(text.as_bytes()))) {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if !endpoint.emit(TransportEvent::Data(data)) {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.as_str().to_string());
                    endpoint.emit(TransportEvent::Closed(reason));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(target: "broker_transport", "WebSocket read error: {}", e);
                    endpoint.emit(TransportEvent::Error(classify_ws_error(e)));
                    break;
                }
                None => {
                    endpoint.emit(TransportEvent::Closed(None));
                    break;
                }
            }
        }
    }
}

fn to_message(bytes: Bytes) -> Message {
    if std::str::from_utf8(&bytes).is_ok() {
        Message::text(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        Message::Binary(bytes)
    }
}

fn classify_ws_error(error: WsError) -> TransportError {
    match error {
        WsError::Io(e) => classify_io_error(&e),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            TransportError::Closed(error.to_string())
        }
        WsError::Http(response) => {
            TransportError::Refused(format!("handshake rejected with {}", response.status()))
        }
        WsError::Url(e) => TransportError::UnsupportedEndpoint(e.to_string()),
        other => TransportError::Io(other.to_string()),
    }
}

/// Endpoint without userinfo or query, safe for logs
fn redact_endpoint(endpoint: &Url) -> String {
    let mut clean = endpoint.clone();
    let _ = clean.set_username("");
    let _ = clean.set_password(None);
    clean.set_query(None);
    clean.to_string()
}
