//! Field-tag driven projection between [`BencodeValue`] and typed records.
//!
//! The rest of the crate still hand-writes its parsers directly
//! (`torrent::file::parse_info_dict` et al.) rather than deriving
//! through a macro, but every one of those parsers bottoms out in the
//! helpers here: get a field out of a dict by key, defaulting if it's
//! absent and failing with [`BencodeError::SchemaViolation`] if it's present
//! with the wrong shape. `project`/`reflect` compose those helpers into the
//! two directions named in the format description: decode-then-type and
//! type-then-encode.
use super::{BencodeError, BencodeResult, BencodeValue};
use std::collections::HashMap;

pub type Dict = HashMap<Vec<u8>, BencodeValue>;

/// Looks up `key` in `dict`, applying `f` to the raw value if present.
/// Returns `Ok(None)` if the field is missing (callers decide the zero
/// value), and `Err` if the field is present but `f` rejects its shape.
pub fn get_field<'a, T>(
    dict: &'a Dict,
    key: &[u8],
    f: impl FnOnce(&'a BencodeValue) -> Option<T>,
) -> BencodeResult<Option<T>> {
    match dict.get(key) {
        None => Ok(None),
        Some(v) => f(v).map(Some).ok_or_else(|| {
            BencodeError::SchemaViolation(format!(
                "field {:?} has the wrong bencode type",
                String::from_utf8_lossy(key)
            ))
        }),
    }
}

/// Required byte-string field; missing is a schema violation (unlike
/// `get_field`, which lets the caller supply its own zero value).
pub fn require_bytes(dict: &Dict, key: &[u8]) -> BencodeResult<Vec<u8>> {
    get_field(dict, key, |v| v.as_bytes().map(|b| b.to_vec()))?.ok_or_else(|| {
        BencodeError::SchemaViolation(format!(
            "missing required field {:?}",
            String::from_utf8_lossy(key)
        ))
    })
}

/// Required UTF-8 string field.
pub fn require_string(dict: &Dict, key: &[u8]) -> BencodeResult<String> {
    let bytes = require_bytes(dict, key)?;
    String::from_utf8(bytes)
        .map_err(|e| BencodeError::SchemaViolation(format!("field not UTF-8: {e}")))
}

/// Required integer field.
pub fn require_integer(dict: &Dict, key: &[u8]) -> BencodeResult<i64> {
    get_field(dict, key, BencodeValue::as_integer)?.ok_or_else(|| {
        BencodeError::SchemaViolation(format!(
            "missing required field {:?}",
            String::from_utf8_lossy(key)
        ))
    })
}

/// Optional string field defaulting to `""` when absent.
pub fn string_or_default(dict: &Dict, key: &[u8]) -> BencodeResult<String> {
    match get_field(dict, key, |v| v.as_bytes().map(|b| b.to_vec()))? {
        Some(bytes) => String::from_utf8(bytes)
            .map_err(|e| BencodeError::SchemaViolation(format!("field not UTF-8: {e}"))),
        None => Ok(String::new()),
    }
}

/// Optional integer field defaulting to `0` when absent.
pub fn integer_or_default(dict: &Dict, key: &[u8]) -> BencodeResult<i64> {
    Ok(get_field(dict, key, BencodeValue::as_integer)?.unwrap_or(0))
}

/// Trait implemented by typed records that can be read back out of a
/// decoded [`BencodeValue`]. Unknown dict keys are simply never looked up
/// and so are silently ignored, per the projection contract.
pub trait FromBencode: Sized {
    fn from_bencode(value: &BencodeValue) -> BencodeResult<Self>;
}

/// Trait implemented by typed records that know how to rebuild the
/// [`BencodeValue`] tree that `encode` would serialize canonically.
pub trait ToBencode {
    fn to_bencode(&self) -> BencodeValue;
}

/// Decodes bencode bytes straight into a typed record.
pub fn project<T: FromBencode>(value: &BencodeValue) -> BencodeResult<T> {
    T::from_bencode(value)
}

/// Rebuilds a `BencodeValue` from a typed record.
pub fn reflect<T: ToBencode>(record: &T) -> BencodeValue {
    record.to_bencode()
}

pub(crate) fn dict_of(value: &BencodeValue) -> BencodeResult<&Dict> {
    value
        .as_dict()
        .ok_or_else(|| BencodeError::SchemaViolation("expected a dictionary".to_string()))
}
