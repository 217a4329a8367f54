//! TLS trust configuration and certificate-error classification.
//!
//! The trust store starts from the system roots and may be extended with
//! a single pinned PEM anchor for the connection. Handshake failures are
//! classified so the front-end can distinguish "the server's certificate
//! was rejected" from ordinary connectivity errors.

use std::io::Cursor;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use rustls::{ClientConfig, RootCertStore};
use tokio_tungstenite::tungstenite;

use crate::error::{WsError, WsResult};

/// Matches invalid-certificate errors that reach us as plain text rather
/// than a typed rustls error. Platforms phrase these inconsistently.
static INVALID_CERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("unknown authority|not standards compliant|not trusted|invalid peer certificate")
        .expect("static pattern")
});

/// Build the trust configuration for a connection: system roots plus the
/// optional pinned PEM anchor. Fails with an invalid-certificate error if
/// the pin contains no parseable certificate.
pub(crate) fn build_tls_config(pinned_pem: &[u8]) -> WsResult<Arc<ClientConfig>> {
    // The config builder resolves the process crypto provider.
    crate::init_crypto();

    let mut roots = RootCertStore::empty();
    if let Ok(native) = rustls_native_certs::load_native_certs() {
        // Unusable system entries are skipped, as is a missing store.
        roots.add_parsable_certificates(native);
    }

    if !pinned_pem.is_empty() {
        let mut reader = Cursor::new(pinned_pem);
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|err| WsError::InvalidCertificate(err.to_string()))?;
            roots
                .add(cert)
                .map_err(|err| WsError::InvalidCertificate(err.to_string()))?;
            added += 1;
        }
        if added == 0 {
            return Err(WsError::InvalidCertificate(
                "no certificates found in PEM block".to_string(),
            ));
        }
    }

    let config = ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Check whether a handshake error is one of the invalid-certificate
/// variants: a typed rustls certificate rejection anywhere in the source
/// chain, or a textual form matching the known phrasings.
pub(crate) fn is_invalid_cert_error(err: &tungstenite::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = source {
        if let Some(tls_err) = cause.downcast_ref::<rustls::Error>() {
            if matches!(tls_err, rustls::Error::InvalidCertificate(_)) {
                return true;
            }
        }
        if INVALID_CERT_RE.is_match(&cause.to_string()) {
            return true;
        }
        source = cause.source();
    }
    false
}
