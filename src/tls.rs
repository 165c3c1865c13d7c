//! TLS server configuration for the LDAPS listener: load PEM certificate and key, build TlsAcceptor.

use crate::config::TlsConfig;
use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use std::fs;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build the LDAPS acceptor from the configured certificate and key files.
pub fn acceptor_from_config(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let config = load_server_config_from_files(&tls.cert_file, &tls.key_file)?;
    Ok(TlsAcceptor::from(config))
}

/// Build a rustls ServerConfig from PEM certificate and key file paths.
pub fn load_server_config_from_files(
    cert_file: &str,
    key_file: &str,
) -> Result<Arc<rustls::ServerConfig>> {
    let cert_pem = fs::read(cert_file).with_context(|| format!("Open cert file: {}", cert_file))?;
    let key_pem = fs::read(key_file).with_context(|| format!("Open key file: {}", key_file))?;
    load_server_config_from_pem(&cert_pem, &key_pem)
        .with_context(|| format!("TLS material from {} and {}", cert_file, key_file))
}

/// Build ServerConfig from PEM bytes. PKCS#8, PKCS#1 and SEC1 keys are accepted.
pub fn load_server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<rustls::ServerConfig>> {
    let certs: Vec<CertificateDer<'static>> = certs(&mut std::io::Cursor::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .context("Parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates in PEM data");
    }
    let key: PrivateKeyDer<'static> = private_key(&mut std::io::Cursor::new(key_pem))
        .context("Parse PEM private key")?
        .ok_or_else(|| anyhow::anyhow!("No private key in PEM data"))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Build ServerConfig from PEM")?;
    Ok(Arc::new(config))
}
