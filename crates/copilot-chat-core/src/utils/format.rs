/// Number of leading characters of a secret that may appear in logs.
const REDACTED_PREFIX_CHARS: usize = 6;

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Render a secret for logging: a short prefix plus the total length.
pub fn redact_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(REDACTED_PREFIX_CHARS).collect();
    format!("{}… (len {})", prefix, secret.len())
}

/// Single-line preview of message text for debug logging
pub fn preview(text: &str, max_len: usize) -> String {
    let flat = text.replace(['\n', '\r'], " ");
    truncate_string(&flat, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("Hello", 10), "Hello");
        assert_eq!(truncate_string("Hello World", 8), "Hello...");
        assert_eq!(truncate_string("Hi", 2), "Hi");
        // Multi-byte characters are never split
        assert_eq!(truncate_string("안녕하세요 세계", 5), "안녕...");
    }

    #[test]
    fn test_redact_secret() {
        assert_eq!(redact_secret("gho_abcdefghijkl"), "gho_ab… (len 16)");
        assert_eq!(redact_secret("abc"), "abc… (len 3)");
    }

    #[test]
    fn test_preview_flattens_newlines() {
        assert_eq!(preview("line one\nline two", 100), "line one line two");
        assert_eq!(preview("a\r\nb", 10), "a  b");
    }
}
