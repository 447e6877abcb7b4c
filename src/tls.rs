use anyhow::{Context, Result, anyhow};
use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
use rustls_pemfile::certs;
use std::{fs::File, io::BufReader, path::Path, sync::Arc};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};
use tracing::warn;

/// Builds the client TLS configuration for a `secure` rule.
///
/// Trust roots come from `ca_file` when given, otherwise from the platform
/// store.
pub fn client_config(ca_file: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let roots = match ca_file {
        Some(path) => load_ca_file(path)?,
        None => load_native_roots()?,
    };

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    // Upgrades and forwarded requests are HTTP/1.1 only
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn load_ca_file(path: &Path) -> Result<RootCertStore> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open CA file: {}", path.display()))?;
    let cert_chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse CA file")?;

    if cert_chain.is_empty() {
        return Err(anyhow!(
            "No certificates found in CA file: {}",
            path.display()
        ));
    }

    let mut roots = RootCertStore::empty();
    for cert in cert_chain {
        roots
            .add(cert)
            .with_context(|| format!("Invalid certificate in CA file: {}", path.display()))?;
    }
    Ok(roots)
}

fn load_native_roots() -> Result<RootCertStore> {
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        warn!(error = %error, "Problem loading native root certificates");
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        warn!(added, ignored, "Ignored unparsable native root certificates");
    }
    if roots.is_empty() {
        return Err(anyhow!("No native root certificates available"));
    }
    Ok(roots)
}

/// Performs the client handshake over an already dialed connection.
pub async fn connect(
    config: &Arc<ClientConfig>,
    host: &str,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_owned())
        .with_context(|| format!("Invalid TLS server name: {host}"))?;
    TlsConnector::from(Arc::clone(config))
        .connect(server_name, stream)
        .await
        .with_context(|| format!("TLS handshake with {host} failed"))
}
