//! Deterministic canonical JSON — the signature input format.
//!
//! The byte image must be stable across implementations and languages:
//! object keys sorted, compact separators, non-ASCII escaped, `null`
//! entries and any key named `signature` dropped. Test vectors are
//! exchanged as raw bytes, so every rule here is load-bearing.

use serde_json::Value;

/// Produce the canonical byte image of a JSON value.
///
/// Rules:
/// - object entries with a `null` value are dropped;
/// - any object key literally named `signature` is dropped;
/// - remaining keys are sorted by byte order of their escaped form;
/// - compact separators (`,` and `:`), no whitespace;
/// - strings escape non-ASCII as `\uXXXX` (surrogate pairs above the BMP);
/// - arrays preserve order; numbers, booleans and `null` use their JSON
///   canonical forms.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_value(value, &mut out);
    out.into_bytes()
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(String, &Value)> = map
                .iter()
                .filter(|(key, value)| key.as_str() != "signature" && !value.is_null())
                .map(|(key, value)| {
                    let mut escaped = String::new();
                    write_string(key, &mut escaped);
                    (escaped, value)
                })
                .collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push('{');
            for (i, (key, value)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_value(value, out);
            }
            out.push('}');
        }
    }
}

/// JSON-encode a string with non-ASCII escaped (`ensure_ascii` semantics).
fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if c.is_ascii() => out.push(c),
            c => {
                let code = c as u32;
                if code <= 0xFFFF {
                    out.push_str(&format!("\\u{code:04x}"));
                } else {
                    // Surrogate pair for characters above the BMP.
                    let v = code - 0x10000;
                    let high = 0xD800 + (v >> 10);
                    let low = 0xDC00 + (v & 0x3FF);
                    out.push_str(&format!("\\u{high:04x}\\u{low:04x}"));
                }
            }
        }
    }
    out.push('"');
}
