// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Peer-certificate identity checks.
//!
//! Identity is trust-on-first-use: the certificate captured at first contact
//! is stored and every later message from that peer must present bit-equal
//! certificate material.  Comparison is constant-time over normalized PEM
//! so it does not leak the position of the first mismatching byte.
//!
//! Certificates arriving through a terminating proxy header may carry tab
//! characters in place of newlines; normalization removes all whitespace,
//! so both encodings compare equal to the on-disk PEM.

use base64::Engine as _;
use subtle::ConstantTimeEq;

const BEGIN_MARKER: &str = "-----BEGINCERTIFICATE-----";
const END_MARKER: &str = "-----ENDCERTIFICATE-----";

/// Reduce a PEM certificate to its base64 payload bytes: strip all
/// whitespace (spaces, newlines, proxy-inserted tabs) and the BEGIN/END
/// markers.
pub fn normalize_pem(pem: &str) -> Vec<u8> {
    let mut compact: String = pem.chars().filter(|c| !c.is_whitespace()).collect();
    compact = compact.replace(BEGIN_MARKER, "");
    compact = compact.replace(END_MARKER, "");
    compact.into_bytes()
}

/// Compare two certificates after normalization, in constant time.
///
/// `None` and the empty string are the same identity (the no-TLS mode);
/// present-versus-absent is a mismatch.
pub fn certs_differ(a: Option<&str>, b: Option<&str>) -> bool {
    let a = a.map(normalize_pem).unwrap_or_default();
    let b = b.map(normalize_pem).unwrap_or_default();
    if a.len() != b.len() {
        return true;
    }
    a.ct_eq(&b).unwrap_u8() == 0
}

/// Re-encode a DER certificate captured from a TLS session as PEM.
pub fn der_to_pem(der: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = String::with_capacity(b64.len() + 64);
    out.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}

// ── Unit tests ────────────────────────────────────────────────────────────────
