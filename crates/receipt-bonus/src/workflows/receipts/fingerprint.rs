//! Content fingerprints used to detect the same paper receipt being submitted twice.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use super::catalog::normalize_text;
use super::domain::OcrLine;

/// Hex SHA-256 over the normalised OCR lines, the declared total and the purchase timestamp.
///
/// Normalising first makes the fingerprint stable across re-photographs that only differ
/// in letter case or spacing.
pub fn compute(
    lines: &[OcrLine],
    declared_total: Option<i64>,
    purchased_at: Option<DateTime<Utc>>,
) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(normalize_text(&line.raw_text).as_bytes());
        hasher.update(b"|");
        hasher.update(line.quantity.unwrap_or(1).to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(line.unit_price.unwrap_or(0).to_string().as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"total=");
    if let Some(total) = declared_total {
        hasher.update(total.to_string().as_bytes());
    }
    hasher.update(b";ts=");
    if let Some(ts) = purchased_at {
        hasher.update(ts.to_rfc3339_opts(SecondsFormat::Secs, true).as_bytes());
    }
    hex::encode(hasher.finalize())
}
