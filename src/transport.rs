use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::codec::Codec;
use crate::config::ConnectOptions;
use crate::error::{CableError, Result};
use crate::protocol::InboundFrame;

pub type CableStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn dial(url: &str, options: &ConnectOptions) -> Result<CableStream> {
    let mut request = url
        .into_client_request()
        .map_err(|err| CableError::Handshake(format!("invalid url {url}: {err}")))?;

    let headers = request.headers_mut();
    for (name, value) in &options.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| CableError::InvalidOptions(format!("header name {name}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| CableError::InvalidOptions(format!("header {name}: {err}")))?;
        headers.insert(name, value);
    }
    if let Some(cookies) = options.cookies.as_deref().filter(|c| !c.is_empty()) {
        let value = HeaderValue::from_str(cookies)
            .map_err(|err| CableError::InvalidOptions(format!("cookies: {err}")))?;
        headers.insert("Cookie", value);
    }

    let handshake_timeout = options.handshake_timeout();
    let (ws, response) = timeout(handshake_timeout, connect_async(request))
        .await
        .map_err(|_| {
            CableError::Handshake(format!(
                "no websocket upgrade from {url} within {}s",
                handshake_timeout.as_secs()
            ))
        })??;
    debug!("websocket upgraded on {url} (status {})", response.status());
    Ok(ws)
}

/// Pings may precede the welcome; any other first frame is a handshake error.
pub async fn await_welcome<S>(
    ws: &mut WebSocketStream<S>,
    codec: Codec,
    limit: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let wait = async {
        while let Some(frame) = ws.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => return Err(CableError::Transport(err)),
            };
            let decoded = match frame {
                WsMessage::Text(text) => codec.decode_text(&text),
                WsMessage::Binary(bytes) => codec.decode_binary(&bytes),
                WsMessage::Close(frame) => {
                    return Err(CableError::Handshake(format!(
                        "closed before welcome: {frame:?}"
                    )))
                }
                _ => continue,
            };
            match decoded {
                Ok(InboundFrame::Welcome) => return Ok(()),
                Ok(InboundFrame::Ping) => trace!("ping before welcome"),
                Ok(other) => {
                    return Err(CableError::Handshake(format!(
                        "expected welcome, got {other:?}"
                    )))
                }
                Err(err) => {
                    return Err(CableError::Handshake(format!(
                        "expected welcome, got undecodable frame: {err}"
                    )))
                }
            }
        }
        Err(CableError::Handshake(
            "stream ended before welcome".to_owned(),
        ))
    };
    timeout(limit, wait).await.map_err(|_| {
        CableError::Handshake(format!("no welcome within {}ms", limit.as_millis()))
    })?
}
