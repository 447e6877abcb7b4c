use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::UnsyncBoxBody};
use hyper::{
    Request, Response, StatusCode, Uri, Version,
    body::Incoming,
    client::conn::http1,
    header::{CONNECTION, CONTENT_TYPE, HOST, HeaderMap, HeaderName, HeaderValue},
    http::uri::PathAndQuery,
};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tracing::{debug, error, info};

use crate::{dial, listener::RelayContext, rule::Rule, stream::UpstreamStream, tls};

/// Response body type shared by every handler on an HTTP listener.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

/// Plain-text error response carrying `message` as its body.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let message: String = message.into();
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Removes hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn host_header(rule: &Rule) -> Result<HeaderValue> {
    let host = &rule.target.host;
    let value = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.clone()
    };
    HeaderValue::from_str(&value).with_context(|| format!("Invalid target host: {host}"))
}

/// Rewrites an inbound request for the rule's target.
///
/// Method, request-target and end-to-end headers are kept; `Host` becomes the
/// target host. The body is moved over untouched so it streams.
pub fn build_outbound_request<B>(req: Request<B>, rule: &Rule) -> Result<Request<B>> {
    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map_or("/", PathAndQuery::as_str);
    let url = format!("{}://{}{path}", rule.http_scheme(), rule.target);
    let url: Uri = url
        .parse()
        .with_context(|| format!("Invalid upstream URL: {url}"))?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.insert(HOST, host_header(rule)?);

    let mut outbound = Request::new(body);
    *outbound.method_mut() = parts.method;
    // Sent in origin form; the connection already points at the target
    *outbound.uri_mut() = url
        .path_and_query()
        .cloned()
        .map_or_else(|| Uri::from_static("/"), Uri::from);
    *outbound.version_mut() = Version::HTTP_11;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

async fn send_upstream(req: Request<Incoming>, context: &RelayContext) -> Result<Response<Incoming>> {
    let rule = &context.rule;
    let tcp = dial::connect(&rule.target, rule.source.as_ref()).await?;
    let stream = match &context.tls {
        Some(config) => {
            UpstreamStream::Tls(Box::new(tls::connect(config, &rule.target.host, tcp).await?))
        }
        None => UpstreamStream::Plain(tcp),
    };
    if let Ok(local_addr) = stream.local_addr() {
        debug!(local_addr = %local_addr, target = %rule.target, "Upstream connection established");
    }

    let (mut sender, connection) = http1::handshake::<_, Incoming>(TokioIo::new(stream))
        .await
        .context("Upstream HTTP handshake failed")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Upstream HTTP connection ended with error");
        }
    });

    sender
        .send_request(req)
        .await
        .with_context(|| format!("Request to {} failed", rule.target))
}

/// Forwards one request to the rule's target and streams the answer back.
pub async fn forward(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    context: &RelayContext,
) -> Response<ProxyBody> {
    let rule = &context.rule;
    let outbound = match build_outbound_request(req, rule) {
        Ok(outbound) => outbound,
        Err(e) => {
            let error = format!("{e:#}");
            error!(remote_addr = %remote_addr, error = %error, "Failed to build upstream request");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, error);
        }
    };

    info!(
        remote_addr = %remote_addr,
        method = %outbound.method(),
        uri = %outbound.uri(),
        "Proxying HTTP connection from {remote_addr} to {}",
        rule.route()
    );

    match send_upstream(outbound, context).await {
        Ok(response) => {
            let mut response = response.map(BodyExt::boxed_unsync);
            strip_hop_by_hop(response.headers_mut());
            response
        }
        Err(e) => {
            let error = format!("{e:#}");
            error!(remote_addr = %remote_addr, error = %error, "Upstream request failed");
            error_response(StatusCode::BAD_GATEWAY, error)
        }
    }
}
