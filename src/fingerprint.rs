//! Canonical primary-key fingerprints.
//!
//! The changeset buffer keys on a string fingerprint of the ordered
//! primary-key tuple. The encoding must be injective (`hash_key(x) ==
//! hash_key(y)` exactly when `x == y`) and reversible into a SQL
//! value-tuple literal, because flushes rebuild `WHERE (pk) IN (...)`
//! predicates from the buffered fingerprints.
//!
//! Each value encodes as a tagged atom:
//!
//! | Tag | Value | Example |
//! |-----|-------|---------|
//! | `i` | signed integer | `i-42` |
//! | `u` | unsigned integer | `u42` |
//! | `f` | float/double text | `f1.5` |
//! | `s` | UTF-8 text, byte-length prefixed | `s5:hello` |
//! | `x` | binary, hex encoded | `x00ff` |
//! | `n` | NULL | `n` |
//!
//! Atoms join with the ASCII unit separator. The length prefix on `s`
//! atoms makes embedded separators unambiguous.

use crate::error::{Result, ShiftError};
use mysql_async::Value;

const SEP: char = '\u{1f}';

/// Fingerprint an ordered primary-key tuple.
pub fn hash_key(values: &[Value]) -> String {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(SEP);
        }
        encode_value(&mut out, value);
    }
    out
}

fn encode_value(out: &mut String, value: &Value) {
    match value {
        Value::NULL => out.push('n'),
        Value::Int(v) => {
            out.push('i');
            out.push_str(&v.to_string());
        }
        Value::UInt(v) => {
            out.push('u');
            out.push_str(&v.to_string());
        }
        Value::Float(v) => {
            out.push('f');
            out.push_str(&v.to_string());
        }
        Value::Double(v) => {
            out.push('f');
            out.push_str(&v.to_string());
        }
        Value::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => encode_text(out, text),
            Err(_) => {
                out.push('x');
                out.push_str(&hex::encode(bytes));
            }
        },
        Value::Date(year, month, day, hour, minute, second, micro) => {
            let text = if (*hour, *minute, *second, *micro) == (0, 0, 0, 0) {
                format!("{year:04}-{month:02}-{day:02}")
            } else if *micro > 0 {
                format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micro:06}"
                )
            } else {
                format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
            };
            encode_text(out, &text);
        }
        Value::Time(negative, days, hours, minutes, seconds, micro) => {
            let sign = if *negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            let text = if *micro > 0 {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{micro:06}")
            } else {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}")
            };
            encode_text(out, &text);
        }
    }
}

fn encode_text(out: &mut String, text: &str) {
    out.push('s');
    out.push_str(&text.len().to_string());
    out.push(':');
    out.push_str(text);
}

/// Reverse a fingerprint into a parenthesized SQL value-tuple literal,
/// e.g. `(7,10)` or `('bob',X'00ff')`.
pub fn unhash_key(hashed: &str) -> Result<String> {
    let bytes = hashed.as_bytes();
    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let tag = bytes[i];
        i += 1;
        match tag {
            b'n' => parts.push("NULL".to_string()),
            b'i' | b'u' | b'f' | b'x' => {
                let start = i;
                while i < bytes.len() && bytes[i] != SEP as u8 {
                    i += 1;
                }
                let atom = &hashed[start..i];
                if tag == b'x' {
                    parts.push(format!("X'{atom}'"));
                } else {
                    parts.push(atom.to_string());
                }
            }
            b's' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i >= bytes.len() || bytes[i] != b':' {
                    return Err(ShiftError::invalid_state(format!(
                        "malformed key fingerprint: {hashed}"
                    )));
                }
                let len: usize = hashed[start..i]
                    .parse()
                    .map_err(|_| ShiftError::invalid_state("malformed key fingerprint"))?;
                i += 1;
                if i + len > bytes.len() {
                    return Err(ShiftError::invalid_state(format!(
                        "truncated key fingerprint: {hashed}"
                    )));
                }
                parts.push(quote_text(&hashed[i..i + len]));
                i += len;
            }
            _ => {
                return Err(ShiftError::invalid_state(format!(
                    "unknown fingerprint tag {:?} in {hashed}",
                    tag as char
                )))
            }
        }
        if i < bytes.len() {
            if bytes[i] != SEP as u8 {
                return Err(ShiftError::invalid_state(format!(
                    "malformed key fingerprint: {hashed}"
                )));
            }
            i += 1;
        }
    }
    Ok(format!("({})", parts.join(",")))
}

fn quote_text(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('\'');
    for c in text.chars() {
        match c {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_int_key() {
        let hashed = hash_key(&[Value::Int(7)]);
        assert_eq!(unhash_key(&hashed).unwrap(), "(7)");
    }

    #[test]
    fn test_composite_key() {
        let hashed = hash_key(&[Value::Int(7), Value::UInt(10)]);
        assert_eq!(unhash_key(&hashed).unwrap(), "(7,10)");
    }

    #[test]
    fn test_string_key() {
        let hashed = hash_key(&[Value::Bytes(b"bob".to_vec())]);
        assert_eq!(unhash_key(&hashed).unwrap(), "('bob')");
    }

    #[test]
    fn test_string_with_embedded_separator() {
        // The unit separator inside the value must not split the atom.
        let tricky = format!("a{}b", '\u{1f}');
        let hashed = hash_key(&[
            Value::Bytes(tricky.clone().into_bytes()),
            Value::Int(1),
        ]);
        assert_eq!(unhash_key(&hashed).unwrap(), format!("('{tricky}',1)"));
    }

    #[test]
    fn test_string_quoting() {
        let hashed = hash_key(&[Value::Bytes(b"o'brien\\x".to_vec())]);
        assert_eq!(unhash_key(&hashed).unwrap(), "('o''brien\\\\x')");
    }

    #[test]
    fn test_binary_key() {
        let hashed = hash_key(&[Value::Bytes(vec![0x00, 0xff, 0x10])]);
        assert_eq!(unhash_key(&hashed).unwrap(), "(X'00ff10')");
    }

    #[test]
    fn test_decimal_text_key() {
        // DECIMAL columns arrive as their text representation.
        let hashed = hash_key(&[Value::Bytes(b"123.45".to_vec())]);
        assert_eq!(unhash_key(&hashed).unwrap(), "('123.45')");
    }

    #[test]
    fn test_datetime_key() {
        let hashed = hash_key(&[Value::Date(2024, 1, 15, 10, 30, 0, 0)]);
        assert_eq!(unhash_key(&hashed).unwrap(), "('2024-01-15 10:30:00')");

        let hashed = hash_key(&[Value::Date(2024, 1, 15, 0, 0, 0, 0)]);
        assert_eq!(unhash_key(&hashed).unwrap(), "('2024-01-15')");
    }

    #[test]
    fn test_injective_over_type_matrix() {
        let matrix: Vec<Vec<Value>> = vec![
            vec![Value::Int(1)],
            vec![Value::Int(-1)],
            vec![Value::UInt(1)],
            vec![Value::Bytes(b"1".to_vec())],
            vec![Value::Bytes(vec![0x31, 0x00])],
            vec![Value::Double(1.0)],
            vec![Value::NULL],
            vec![Value::Int(1), Value::Int(2)],
            vec![Value::Int(12)],
            vec![Value::Bytes(b"a,b".to_vec())],
            vec![Value::Bytes(b"a".to_vec()), Value::Bytes(b"b".to_vec())],
            vec![Value::Bytes(b"a\x1fb".to_vec())],
            vec![Value::Date(2024, 1, 15, 0, 0, 0, 0)],
            vec![Value::Time(false, 0, 10, 30, 0, 0)],
        ];
        let mut seen = std::collections::HashSet::new();
        for values in &matrix {
            let hashed = hash_key(values);
            assert!(seen.insert(hashed.clone()), "collision for {hashed:?}");
            // Every fingerprint must round-trip into a literal.
            unhash_key(&hashed).unwrap();
        }
    }

    #[test]
    fn test_equal_values_equal_fingerprints() {
        let a = hash_key(&[Value::Int(42), Value::Bytes(b"k".to_vec())]);
        let b = hash_key(&[Value::Int(42), Value::Bytes(b"k".to_vec())]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_malformed_fingerprint() {
        assert!(unhash_key("q42").is_err());
        assert!(unhash_key("s9:ab").is_err());
        assert!(unhash_key("s2ab").is_err());
    }
}
