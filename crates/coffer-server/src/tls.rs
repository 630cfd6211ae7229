//! TLS listener setup and peer identity extraction.
//!
//! Clients authenticate with certificates issued by the store's CA; the
//! certificate common name carries the account id as bare hex. No other
//! credential exists, so a connection either maps to an account or is
//! rejected outright.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::TlsAcceptor;
use x509_parser::prelude::{FromDer, X509Certificate};

use coffer_store::AccountId;

use crate::config::TlsFiles;
use crate::error::{ServerError, ServerResult};

fn load_certs(path: &Path) -> ServerResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> ServerResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| ServerError::Tls(format!("{}: no private key found", path.display())))
}

/// Builds a TLS acceptor requiring client certificates from our CA.
pub fn build_acceptor(files: &TlsFiles) -> ServerResult<TlsAcceptor> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut roots = RootCertStore::empty();
    for cert in load_certs(&files.ca_cert)? {
        roots
            .add(cert)
            .map_err(|e| ServerError::Tls(format!("bad CA certificate: {e}")))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ServerError::Tls(format!("client verifier: {e}")))?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(
            load_certs(&files.cert_chain)?,
            load_private_key(&files.private_key)?,
        )
        .map_err(|e| ServerError::Tls(format!("server certificate: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Extracts the account id from a client certificate's common name.
///
/// The CN must be the account id as plain hex (with or without fixed-width
/// zero padding).
pub fn account_from_peer_cert(cert_der: &[u8]) -> ServerResult<AccountId> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| ServerError::AuthenticationFailed(format!("unparseable certificate: {e}")))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| {
            ServerError::AuthenticationFailed("certificate has no common name".into())
        })?;

    parse_account_cn(cn)
}

/// Parses a common-name string into an account id.
pub fn parse_account_cn(cn: &str) -> ServerResult<AccountId> {
    let cn = cn.trim();
    if cn.is_empty() || cn.len() > 8 {
        return Err(ServerError::AuthenticationFailed(format!(
            "common name '{cn}' is not an account id"
        )));
    }
    u32::from_str_radix(cn, 16)
        .map(AccountId)
        .map_err(|_| {
            ServerError::AuthenticationFailed(format!(
                "common name '{cn}' is not an account id"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_account_cn() {
        assert_eq!(parse_account_cn("0000000a").unwrap(), AccountId(0xA));
        assert_eq!(parse_account_cn("a").unwrap(), AccountId(0xA));
        assert_eq!(parse_account_cn("deadbeef").unwrap(), AccountId(0xDEADBEEF));
    }

    #[test]
    fn test_parse_account_cn_rejects_garbage() {
        for bad in ["", "not-hex", "123456789", "0x1f"] {
            assert!(matches!(
                parse_account_cn(bad),
                Err(ServerError::AuthenticationFailed(_))
            ));
        }
    }
}
