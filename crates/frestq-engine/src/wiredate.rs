// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire encoding for datetimes.
//!
//! Datetimes travel as bare ISO-8601 strings with microsecond precision,
//! `2026-03-01T12:00:00.000000`.  The receiver converts back any string that
//! matches `^20\d\d.*T.*` and parses; everything else passes through
//! unchanged.  Known footgun: an application string that happens to look
//! like `20..T..` may be silently treated as a datetime by some peers.
//! Keep payload strings out of that shape.

use chrono::{DateTime, NaiveDateTime, Utc};

const ENCODE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const DECODE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Encode for the wire: naive UTC, microsecond precision, no offset suffix.
pub fn encode(dt: &DateTime<Utc>) -> String {
    dt.naive_utc().format(ENCODE_FORMAT).to_string()
}

/// Whether `s` has the shape the decoder converts.
fn looks_like_wire_date(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 4
        && b[0] == b'2'
        && b[1] == b'0'
        && b[2].is_ascii_digit()
        && b[3].is_ascii_digit()
        && s.contains('T')
}

/// Decode a wire string back into a datetime.  Returns `None` for strings
/// that do not match the wire shape or do not parse; callers pass those
/// through untouched.
pub fn try_decode(s: &str) -> Option<DateTime<Utc>> {
    if !looks_like_wire_date(s) {
        return None;
    }
    NaiveDateTime::parse_from_str(s, DECODE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Serde adapter for `Option<DateTime<Utc>>` fields carried in envelopes.
pub mod option {
    use super::*;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&encode(dt)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) => try_decode(&s)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid datetime: {s}"))),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
