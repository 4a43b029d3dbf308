//! Cell encoding for per-table dump files.
//!
//! Dumps are CSV with a header row of column names. NULL is encoded as the
//! sentinel `\N` and blobs as `\x` followed by hex, so every SQL value
//! survives the text round trip; everything else relies on column affinity
//! when read back.

use rusqlite::types::{Value, ValueRef};

const NULL_FIELD: &str = "\\N";
const BLOB_PREFIX: &str = "\\x";

/// Renders one SQL value as a dump field.
pub(crate) fn field_from_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => NULL_FIELD.to_owned(),
        ValueRef::Integer(value) => value.to_string(),
        ValueRef::Real(value) => value.to_string(),
        ValueRef::Text(text) => String::from_utf8_lossy(text).into_owned(),
        ValueRef::Blob(bytes) => {
            let mut field = String::with_capacity(BLOB_PREFIX.len() + bytes.len() * 2);
            field.push_str(BLOB_PREFIX);
            for byte in bytes {
                field.push_str(&format!("{byte:02x}"));
            }
            field
        }
    }
}

/// Parses one dump field back into a bindable SQL value.
pub(crate) fn value_from_field(field: &str) -> Value {
    if field == NULL_FIELD {
        return Value::Null
    }

    if let Some(hex) = field.strip_prefix(BLOB_PREFIX) {
        if let Some(bytes) = decode_hex(hex) {
            return Value::Blob(bytes)
        }
    }

    Value::Text(field.to_owned())
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None
    }

    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_blob_fields_round_trip() {
        assert_eq!(value_from_field(&field_from_value(ValueRef::Null)), Value::Null);

        let blob = ValueRef::Blob(&[0x00, 0xab, 0xff]);
        assert_eq!(field_from_value(blob), "\\x00abff");
        assert_eq!(value_from_field("\\x00abff"), Value::Blob(vec![0x00, 0xab, 0xff]));
    }

    #[test]
    fn scalars_render_as_plain_text() {
        assert_eq!(field_from_value(ValueRef::Integer(42)), "42");
        assert_eq!(field_from_value(ValueRef::Text(b"hello")), "hello");
        assert_eq!(value_from_field("42"), Value::Text("42".to_owned()));
    }

    #[test]
    fn malformed_blob_prefix_stays_text() {
        assert_eq!(value_from_field("\\xzz"), Value::Text("\\xzz".to_owned()));
    }
}
