//! OLPC canonical JSON encoding.
//!
//! Signatures cover the canonical form of the `signed` object, so the encoder
//! must be deterministic (sorted keys, no whitespace, integers only) and
//! injective: two different values never encode to the same bytes.

use olpc_cjson::CanonicalFormatter;
use serde::Serialize;

/// Serializes `value` into canonical JSON bytes.
///
/// Fails when the value contains a floating point number, which canonical
/// JSON cannot represent.
pub fn to_canonical_bytes<T>(value: &T) -> Result<Vec<u8>, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let mut buffer = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buffer, CanonicalFormatter::new());
    value.serialize(&mut serializer)?;
    Ok(buffer)
}
