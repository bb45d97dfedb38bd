//! Minimal config parsing.
//!
//! Module configs arrive as JSON strings, but the only thing ever read out
//! of them is a couple of flat string values. The extraction is a plain
//! substring scan: find the quoted key, the next `:`, then the next two
//! quotes. No unescaping happens; the value is the raw bytes between the
//! quotes. Known limitation: ill-formed JSON that happens to contain the
//! right punctuation is accepted.

/// Extract the string value for `key`, e.g. `plugin_id` out of
/// `{"plugin_id": "surge.xt"}`.
pub(crate) fn extract_string_value<'a>(json: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("\"{key}\"");
    let at = json.find(&needle)?;
    let rest = &json[at + needle.len()..];
    let rest = &rest[rest.find(':')? + 1..];
    let rest = &rest[rest.find('"')? + 1..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Control-plane values are loosely typed strings; unparseable input reads
/// as zero.
pub(crate) fn parse_int(s: &str) -> i32 {
    s.trim().parse().unwrap_or(0)
}

pub(crate) fn parse_float(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_plugin_id() {
        assert_eq!(
            extract_string_value(r#"{"plugin_id": "surge.xt"}"#, "plugin_id"),
            Some("surge.xt")
        );
        assert_eq!(
            extract_string_value(r#"{ "other": 1, "plugin_id":"a.b" }"#, "plugin_id"),
            Some("a.b")
        );
    }

    #[test]
    fn test_missing_key() {
        assert_eq!(extract_string_value(r#"{"preset": "x"}"#, "plugin_id"), None);
        assert_eq!(extract_string_value("", "plugin_id"), None);
    }

    #[test]
    fn test_malformed_values() {
        assert_eq!(
            extract_string_value(r#"{"plugin_id": "unterminated"#, "plugin_id"),
            None
        );
        assert_eq!(extract_string_value(r#"{"plugin_id"}"#, "plugin_id"), None);
        // Empty value is extracted; callers decide whether to act on it.
        assert_eq!(
            extract_string_value(r#"{"plugin_id": ""}"#, "plugin_id"),
            Some("")
        );
    }

    #[test]
    fn test_loose_value_parsing() {
        assert_eq!(parse_int("42"), 42);
        assert_eq!(parse_int(" -3 "), -3);
        assert_eq!(parse_int("nope"), 0);
        assert_eq!(parse_float("0.25"), 0.25);
        assert_eq!(parse_float("x"), 0.0);
    }

    #[test]
    fn test_no_unescaping() {
        // Backslash escapes are passed through raw, stopping at the first
        // quote byte.
        assert_eq!(
            extract_string_value(r#"{"plugin_id": "a\"b"}"#, "plugin_id"),
            Some("a\\")
        );
    }
}
