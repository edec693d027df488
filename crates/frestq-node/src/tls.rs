// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! TLS serving material.
//!
//! The node serves its configured PEM certificate/key pair through
//! axum-server's rustls binding.  Inbound peer certificates are not taken
//! from the handshake here: the deployment convention is a terminating
//! proxy that forwards the client certificate in a request header (see the
//! ingress), while outbound capture happens on the client side of each
//! exchange.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

use crate::error::NodeError;

/// Check that `path` holds at least one parseable PEM certificate.
pub(crate) fn validate_cert_file(path: &Path) -> Result<(), NodeError> {
    let pem = std::fs::read(path)?;
    let mut reader = std::io::Cursor::new(&pem);
    let count = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NodeError::Tls(format!("parsing {}: {e}", path.display())))?
        .len();
    if count == 0 {
        return Err(NodeError::Tls(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(())
}

/// Build the rustls server config from the configured PEM pair.
pub(crate) async fn rustls_config(cert: &Path, key: &Path) -> Result<RustlsConfig, NodeError> {
    validate_cert_file(cert)?;
    RustlsConfig::from_pem_file(cert, key)
        .await
        .map_err(|e| NodeError::Tls(format!("loading TLS identity: {e}")))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
