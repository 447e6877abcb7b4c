use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper::{
    Request, Response, StatusCode,
    body::Incoming,
    header::{
        CONNECTION, HeaderMap, HeaderName, HeaderValue, ORIGIN, SEC_WEBSOCKET_ACCEPT,
        SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, UPGRADE,
    },
    http::uri::PathAndQuery,
};
use hyper_util::rt::TokioIo;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config,
    tungstenite::{
        Error as TungsteniteError, Message,
        client::IntoClientRequest,
        error::ProtocolError,
        handshake::{client, derive_accept_key},
        protocol::Role,
    },
};
use tracing::{debug, error, info, warn};

use crate::{
    dial,
    http::{ProxyBody, empty_body, error_response},
    listener::RelayContext,
    rule::Rule,
};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// True for a `Connection: upgrade` + `Upgrade: websocket` request.
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    has_token(req.headers(), &CONNECTION, "upgrade")
        && has_token(req.headers(), &UPGRADE, "websocket")
}

/// Builds the upstream handshake request for an inbound upgrade.
///
/// The Origin sent upstream depends on the rule: with a source address it is
/// synthesized from that address and the listening port, otherwise the
/// client's own Origin (if any) is passed through.
pub fn build_upstream_request<B>(
    req: &Request<B>,
    rule: &Rule,
    local_port: u16,
) -> Result<client::Request> {
    let path = req.uri().path_and_query().map_or("/", PathAndQuery::as_str);
    let url = format!("{}://{}{path}", rule.websocket_scheme(), rule.target);
    let mut upstream = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("Invalid upstream URL: {url}"))?;

    let origin = match rule.websocket_origin(local_port) {
        Some(origin) => Some(HeaderValue::from_str(&origin).context("Invalid Origin header")?),
        None => req.headers().get(ORIGIN).cloned(),
    };
    if let Some(origin) = origin {
        upstream.headers_mut().insert(ORIGIN, origin);
    }
    if let Some(protocols) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        upstream
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    }
    Ok(upstream)
}

async fn dial_upstream(
    request: client::Request,
    context: &RelayContext,
) -> Result<(UpstreamSocket, client::Response)> {
    let rule = &context.rule;
    let tcp = dial::connect(&rule.target, rule.source.as_ref()).await?;
    let connector = context
        .tls
        .as_ref()
        .map(|config| Connector::Rustls(Arc::clone(config)));
    client_async_tls_with_config(request, tcp, None, connector)
        .await
        .with_context(|| format!("WebSocket handshake with {} failed", rule.target))
}

/// Answers an inbound upgrade request.
///
/// The upstream is dialed first so a failure can still be reported as an
/// HTTP error; on success the 101 response is returned and the relay runs on
/// its own task once hyper hands over the upgraded connection.
pub async fn upgrade(
    mut req: Request<Incoming>,
    remote_addr: SocketAddr,
    context: &RelayContext,
) -> Response<ProxyBody> {
    let Some(accept_key) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|key| HeaderValue::from_str(&derive_accept_key(key.as_bytes())).ok())
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key header");
    };

    let upstream_request = match build_upstream_request(&req, &context.rule, context.local_port) {
        Ok(request) => request,
        Err(e) => {
            let error = format!("{e:#}");
            error!(remote_addr = %remote_addr, error = %error, "Failed to build upstream request");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, error);
        }
    };
    let uri = upstream_request.uri().clone();

    let (upstream, upstream_response) = match dial_upstream(upstream_request, context).await {
        Ok(pair) => pair,
        Err(e) => {
            let error = format!("{e:#}");
            error!(remote_addr = %remote_addr, error = %error, "Failed to connect upstream WebSocket");
            return error_response(StatusCode::BAD_GATEWAY, error);
        }
    };

    info!(
        remote_addr = %remote_addr,
        uri = %uri,
        "Proxying WebSocket connection from {remote_addr} to {}",
        context.rule.route()
    );

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(remote_addr = %remote_addr, error = %e, "Inbound WebSocket upgrade failed");
                return;
            }
        };
        let client =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        relay(client, upstream).await;
        info!(remote_addr = %remote_addr, "WebSocket connection closed");
    });

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept_key);
    if let Some(protocol) = upstream_response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    response
}

/// Relays messages both ways until either side stops.
pub async fn relay<C, U>(client: WebSocketStream<C>, upstream: WebSocketStream<U>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (client_sender, client_receiver) = client.split();
    let (upstream_sender, upstream_receiver) = upstream.split();

    tokio::select! {
        () = forward_messages(client_receiver, upstream_sender, "client") => {}
        () = forward_messages(upstream_receiver, client_sender, "upstream") => {}
    }
}

async fn forward_messages<R, W>(mut receiver: R, mut sender: W, from: &'static str)
where
    R: Stream<Item = Result<Message, TungsteniteError>> + Unpin,
    W: Sink<Message, Error = TungsteniteError> + Unpin,
{
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                debug!(from, bytes = msg.len(), "Forwarding WebSocket message");
                if let Err(e) = sender.send(msg).await {
                    warn!(from, error = %e, "Failed to forward WebSocket message");
                    break;
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(from, "WebSocket close received");
                // Keep reading so the close handshake on this side completes
                let _ = sender.send(Message::Close(frame)).await;
            }
            // Ping and pong are answered per hop
            Ok(_) => {}
            Err(e) => {
                match e {
                    TungsteniteError::ConnectionClosed
                    | TungsteniteError::AlreadyClosed
                    | TungsteniteError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        debug!(from, "Peer disconnected: {e}");
                    }
                    _ => {
                        warn!(from, "WebSocket error: {e}");
                    }
                }
                break;
            }
        }
    }
    debug!(from, "WebSocket direction finished");
}
