use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/v\d+$").unwrap());

/// Normalizes an OpenAI-compatible base URL: appends `/v1` when no version
/// segment is present. A trailing `#` pins the URL as-is and is stripped.
pub fn normalize_base_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if trimmed.ends_with('#') {
        return trimmed.trim_end_matches('#').to_string();
    }

    if !VERSION_SUFFIX_RE.is_match(trimmed) && !trimmed.contains("/v1") {
        let without_slash = trimmed.trim_end_matches('/');
        format!("{}/v1", without_slash)
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_v1_when_missing() {
        assert_eq!(
            normalize_base_url("https://api.deepseek.com"),
            "https://api.deepseek.com/v1"
        );
    }

    #[test]
    fn keeps_existing_version_segment() {
        assert_eq!(
            normalize_base_url("https://example.com/v2"),
            "https://example.com/v2"
        );
    }

    #[test]
    fn hash_suffix_pins_the_url() {
        assert_eq!(
            normalize_base_url("https://example.com/#"),
            "https://example.com/"
        );
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(normalize_base_url("  "), "");
    }
}
