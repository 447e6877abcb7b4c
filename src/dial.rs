use anyhow::{Context, Result, anyhow};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tracing::debug;

use crate::rule::{SourceAddress, Target};

/// Opens the outbound TCP connection for a relay session.
///
/// With a source address the socket is bound to it before connecting, so
/// traffic leaves through that local interface instead of the one the
/// routing table would pick.
pub async fn connect(target: &Target, source: Option<&SourceAddress>) -> Result<TcpStream> {
    let Some(source) = source else {
        return TcpStream::connect((target.host.as_str(), target.port))
            .await
            .with_context(|| format!("Failed to connect to target {target}"));
    };

    let local = source.socket_addr();
    let remote = lookup_host((target.host.as_str(), target.port))
        .await
        .with_context(|| format!("Failed to resolve target {target}"))?
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| {
            anyhow!("Target {target} has no address in the same family as source {source}")
        })?;

    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("Failed to create outbound socket")?;
    socket
        .bind(local)
        .with_context(|| format!("Failed to bind source address {source}"))?;

    debug!(target_addr = %remote, source = %source, "Dialing through source address");
    socket
        .connect(remote)
        .await
        .with_context(|| format!("Failed to connect to target {target} through {source}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_test::assert_err;

    async fn accepting_listener() -> (TcpListener, Target) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Target::new("127.0.0.1", port))
    }

    async fn observed_peer(listener: &TcpListener) -> SocketAddr {
        let (_, peer) = listener.accept().await.unwrap();
        peer
    }

    #[tokio::test]
    async fn default_dial_reaches_target() {
        let (listener, target) = accepting_listener().await;
        let stream = connect(&target, None).await.unwrap();
        let peer = observed_peer(&listener).await;
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[tokio::test]
    async fn resolves_host_names() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = Target::new("localhost", port);
        let source: SourceAddress = "127.0.0.1".parse().unwrap();
        connect(&target, Some(&source)).await.unwrap();
        observed_peer(&listener).await;
    }

    #[tokio::test]
    async fn binds_to_source_address() {
        let (listener, target) = accepting_listener().await;
        let source: SourceAddress = "127.0.0.1".parse().unwrap();
        let stream = connect(&target, Some(&source)).await.unwrap();
        let peer = observed_peer(&listener).await;
        assert_eq!(peer.ip(), source.ip());
        assert_eq!(peer, stream.local_addr().unwrap());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn source_address_overrides_default_route() {
        // Linux routes the whole 127/8 block to loopback
        let (listener, target) = accepting_listener().await;
        let source: SourceAddress = "127.0.0.2".parse().unwrap();
        connect(&target, Some(&source)).await.unwrap();
        let peer = observed_peer(&listener).await;
        assert_eq!(peer.ip(), source.ip());
    }

    #[tokio::test]
    async fn reports_family_mismatch() {
        let (_listener, target) = accepting_listener().await;
        let source: SourceAddress = "::1".parse().unwrap();
        let err = connect(&target, Some(&source)).await.unwrap_err();
        assert!(format!("{err}").contains("same family"), "{err}");
    }

    #[tokio::test]
    async fn reports_refused_connection() {
        let (listener, target) = accepting_listener().await;
        drop(listener);
        assert_err!(connect(&target, None).await);
        let source: SourceAddress = "127.0.0.1".parse().unwrap();
        assert_err!(connect(&target, Some(&source)).await);
    }
}
