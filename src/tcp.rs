use anyhow::Result;
use std::net::SocketAddr;
use tokio::{io, net::TcpStream};
use tracing::{debug, info};

use crate::{dial, rule::Rule};

/// Relays one accepted connection to the rule's target until either
/// direction finishes, then closes both sides.
#[tracing::instrument(skip(inbound, rule), fields(target = %rule.target))]
pub async fn relay(inbound: TcpStream, remote_addr: SocketAddr, rule: &Rule) -> Result<()> {
    // Dropping `inbound` on a dial error closes the client connection
    let outbound = dial::connect(&rule.target, rule.source.as_ref()).await?;

    info!(
        remote_addr = %remote_addr,
        "Proxying TCP connection from {remote_addr} to {}",
        rule.route()
    );

    let (mut inbound_reader, mut inbound_writer) = inbound.into_split();
    let (mut outbound_reader, mut outbound_writer) = outbound.into_split();

    let client_to_target = io::copy(&mut inbound_reader, &mut outbound_writer);
    let target_to_client = io::copy(&mut outbound_reader, &mut inbound_writer);

    // No half-close: the first direction to stop ends the whole session
    tokio::select! {
        result = client_to_target => match result {
            Ok(bytes) => debug!(bytes, "Client side finished"),
            Err(e) => debug!(error = %e, "Client to target copy failed"),
        },
        result = target_to_client => match result {
            Ok(bytes) => debug!(bytes, "Target side finished"),
            Err(e) => debug!(error = %e, "Target to client copy failed"),
        },
    }

    info!(remote_addr = %remote_addr, "TCP connection closed");
    Ok(())
}
