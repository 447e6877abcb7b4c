use anyhow::{Context, Result};
use hyper::{Request, Response, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use std::{
    convert::Infallible,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::TcpListener, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    http::{self, ProxyBody},
    rule::{Rule, RuleKind},
    tcp, tls, websocket,
};

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Immutable per-listener state handed to every relay session of a rule.
#[derive(Debug)]
pub struct RelayContext {
    pub rule: Rule,
    /// Port the listener actually bound.
    pub local_port: u16,
    /// Client TLS settings, present for `secure` rules.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

/// A rule whose listener is bound and accepting.
#[derive(Debug)]
pub struct RunningRule {
    context: Arc<RelayContext>,
    local_addr: SocketAddr,
}

impl RunningRule {
    pub fn rule(&self) -> &Rule {
        &self.context.rule
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Binds the rule's port and starts its accept loop on a background task.
pub async fn start_rule(rule: Rule, listen_ip: IpAddr) -> Result<RunningRule> {
    let tls = if rule.secure {
        Some(
            tls::client_config(rule.ca_file.as_deref())
                .context("Failed to build upstream TLS configuration")?,
        )
    } else {
        None
    };

    let addr = SocketAddr::new(listen_ip, rule.local_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} proxy to {addr}", rule.kind))?;
    let local_addr = listener
        .local_addr()
        .context("Failed to get bound listener local address")?;

    let context = Arc::new(RelayContext {
        rule,
        local_port: local_addr.port(),
        tls,
    });

    info!(
        local_addr = %local_addr,
        target = %context.rule.target,
        "Started {} proxy on port {}",
        context.rule.kind,
        local_addr.port()
    );

    match context.rule.kind {
        RuleKind::Tcp => {
            tokio::spawn(serve_tcp(listener, Arc::clone(&context)));
        }
        RuleKind::Http | RuleKind::WebSocket => {
            tokio::spawn(serve_http(listener, Arc::clone(&context)));
        }
    }

    Ok(RunningRule {
        context,
        local_addr,
    })
}

/// Starts every rule independently; a rule that fails to start is reported
/// and skipped.
pub async fn start_all(rules: Vec<Rule>, listen_ip: IpAddr) -> Vec<RunningRule> {
    let mut running = Vec::with_capacity(rules.len());
    for rule in rules {
        let (kind, local_port) = (rule.kind, rule.local_port);
        match start_rule(rule, listen_ip).await {
            Ok(started) => running.push(started),
            Err(e) => {
                let error = format!("{e:#}");
                error!(kind = %kind, local_port, error = %error, "Skipping rule");
            }
        }
    }
    running
}

async fn accept_failed(local_port: u16, error: &io::Error) {
    warn!(local_port, error = %error, "Failed to accept connection");
    sleep(ACCEPT_RETRY_DELAY).await;
}

async fn serve_tcp(listener: TcpListener, context: Arc<RelayContext>) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                accept_failed(context.local_port, &e).await;
                continue;
            }
        };

        let context = Arc::clone(&context);
        tokio::spawn(async move {
            if let Err(e) = tcp::relay(stream, remote_addr, &context.rule).await {
                let error = format!("{e:#}");
                error!(remote_addr = %remote_addr, error = %error, "Connection failed");
            }
        });
    }
}

async fn serve_http(listener: TcpListener, context: Arc<RelayContext>) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                accept_failed(context.local_port, &e).await;
                continue;
            }
        };

        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let context = Arc::clone(&context);
                async move { Ok::<_, Infallible>(dispatch(req, remote_addr, &context).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!(remote_addr = %remote_addr, error = %e, "HTTP connection ended with error");
            }
        });
    }
}

/// Routes upgrades on WebSocket rules to the WebSocket relay and everything
/// else to the HTTP forwarder.
async fn dispatch(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    context: &RelayContext,
) -> Response<ProxyBody> {
    if context.rule.kind == RuleKind::WebSocket && websocket::is_upgrade_request(&req) {
        websocket::upgrade(req, remote_addr, context).await
    } else {
        http::forward(req, remote_addr, context).await
    }
}
