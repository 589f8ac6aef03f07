//! Hostname validation shared by clients and proxies

/// Lowercase `name` and strip one trailing dot, or `None` when it is not a
/// plain DNS name.
///
/// Labels are 1 to 63 characters of ASCII letters, digits, `-` or `_`, and
/// the whole name is at most 253 characters.
pub fn normalize_hostname(name: &str) -> Option<String> {
    let name = name.strip_suffix('.').unwrap_or(name);
    let valid = !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        });

    valid.then(|| name.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_hostname() {
        assert_eq!(normalize_hostname("x.example").as_deref(), Some("x.example"));
        assert_eq!(normalize_hostname("X.Example.").as_deref(), Some("x.example"));
        assert_eq!(
            normalize_hostname("_acme.x-1.example").as_deref(),
            Some("_acme.x-1.example")
        );
    }

    #[test]
    fn test_rejects_non_hostnames() {
        for name in [
            "",
            ".",
            "x..example",
            "x.example..",
            "x.example:443",
            "x.example/",
            "x example",
        ] {
            assert_eq!(normalize_hostname(name), None, "{name:?} should be rejected");
        }
        assert_eq!(normalize_hostname(&"a".repeat(64)), None);
    }
}
