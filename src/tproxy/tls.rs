//! The two points where a connection may be wrapped in TLS: the listening
//! socket (worker side) and the upstream dial (decision side).

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::pipe::BoxedStream;

/// Listener-side settings from the `--ssl-*` flags.
#[derive(Debug, Clone)]
pub struct TlsServerOptions {
    pub keyfile: PathBuf,
    pub certfile: PathBuf,
    pub ca_certs: Option<PathBuf>,
    pub cert_reqs: CertReqs,
}

/// Whether a certificate is required from the connecting client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertReqs {
    #[default]
    Ignored,
    Optional,
    Required,
}

impl CertReqs {
    pub fn from_int(v: u8) -> Option<Self> {
        match v {
            0 => Some(CertReqs::Ignored),
            1 => Some(CertReqs::Optional),
            2 => Some(CertReqs::Required),
            _ => None,
        }
    }
}

/// Dial-side settings carried by a Forward decision's `ssl_args`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsClientOptions {
    pub ca_certs: Option<PathBuf>,
    pub server_name: Option<String>,
    pub insecure_skip_verify: bool,
}

pub fn acceptor(opts: &TlsServerOptions) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(&opts.certfile)?;
    let key = load_key(&opts.keyfile)?;

    let cfg = match opts.cert_reqs {
        CertReqs::Ignored => rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?,
        reqs => {
            let ca = opts
                .ca_certs
                .as_ref()
                .context("tls: --ssl-cert-reqs needs --ssl-ca-certs")?;
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(ca)? {
                roots.add(cert)?;
            }
            let builder = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = match reqs {
                CertReqs::Optional => builder.allow_unauthenticated().build()?,
                _ => builder.build()?,
            };
            rustls::ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
    };

    Ok(TlsAcceptor::from(Arc::new(cfg)))
}

/// Wrap a freshly connected upstream socket.
pub async fn wrap_upstream(
    sock: TcpStream,
    host: &str,
    opts: &TlsClientOptions,
) -> anyhow::Result<BoxedStream> {
    let cfg = client_config(opts)?;
    let connector = TlsConnector::from(Arc::new(cfg));

    let name = opts
        .server_name
        .clone()
        .unwrap_or_else(|| host.to_string());
    let server_name =
        ServerName::try_from(name.clone()).with_context(|| format!("tls: bad server name {name:?}"))?;

    let stream = connector.connect(server_name, sock).await?;
    Ok(Box::new(stream))
}

fn client_config(opts: &TlsClientOptions) -> anyhow::Result<rustls::ClientConfig> {
    if opts.insecure_skip_verify {
        return Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipServerVerification::new())
            .with_no_client_auth());
    }

    let mut roots = rustls::RootCertStore::empty();
    if let Some(ca) = &opts.ca_certs {
        for cert in load_certs(ca)? {
            roots.add(cert)?;
        }
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = io::Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)?;
    let Some(key) = key else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(key)
}

/// Certificate verifier that accepts anything. MITM-able; for dialing
/// upstreams with self-signed certificates only.
#[derive(Debug)]
struct SkipServerVerification(Arc<rustls::crypto::CryptoProvider>);

impl SkipServerVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
