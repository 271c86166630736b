use regex::Regex;
use serde::{Deserialize, Serialize};

/// An address as external sources report it: sometimes a JSON number,
/// sometimes a string in any of the accepted spellings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AddressValue {
    Number(u64),
    Text(String),
}

impl AddressValue {
    /// Canonical form, or `None` when the value does not parse. A native
    /// number is already a value and skips the string heuristics.
    pub fn normalize(&self) -> Option<String> {
        match self {
            AddressValue::Number(value) => Some(canonical_hex(*value)),
            AddressValue::Text(text) => normalize_address(text),
        }
    }
}

/// Normalizes an address string to `0x` + at least eight uppercase hex
/// digits.
///
/// Accepted spellings: `0x`-prefixed hex, bare hex (anything containing a
/// hex letter), and digit-only strings — parsed as decimal when longer than
/// eight digits, as hex otherwise, since real addresses in the target image
/// are wider than eight decimal digits. Unparsable input is "inconclusive"
/// and comes back as `None`, never an error.
pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value = if let Some(digits) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        u64::from_str_radix(digits, 16).ok()?
    } else if trimmed
        .chars()
        .any(|c| matches!(c, 'a'..='f' | 'A'..='F'))
    {
        u64::from_str_radix(trimmed, 16).ok()?
    } else if trimmed.chars().all(|c| c.is_ascii_digit()) && trimmed.len() > 8 {
        trimmed.parse::<u64>().ok()?
    } else {
        u64::from_str_radix(trimmed, 16).ok()?
    };
    Some(canonical_hex(value))
}

fn canonical_hex(value: u64) -> String {
    format!("0x{value:08X}")
}

/// Pulls the PR number out of a forge URL like `.../pull/1234`.
pub fn pr_number_from_url(url: &str) -> Option<i64> {
    let pattern = Regex::new(r"/pull/([0-9]+)").expect("valid regex");
    pattern
        .captures(url)
        .and_then(|captures| captures.get(1))
        .and_then(|number| number.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_hex_normalizes() {
        assert_eq!(
            normalize_address("0x80073bd8").as_deref(),
            Some("0x80073BD8")
        );
        assert_eq!(
            normalize_address("0X80073BD8").as_deref(),
            Some("0x80073BD8")
        );
    }

    #[test]
    fn bare_hex_with_letters_normalizes() {
        assert_eq!(
            normalize_address("80034e40").as_deref(),
            Some("0x80034E40")
        );
    }

    #[test]
    fn short_digit_strings_parse_as_hex() {
        assert_eq!(normalize_address("1234").as_deref(), Some("0x00001234"));
    }

    #[test]
    fn long_digit_strings_parse_as_decimal() {
        assert_eq!(
            normalize_address("2148154944").as_deref(),
            Some("0x800A3E40")
        );
    }

    #[test]
    fn garbage_is_inconclusive() {
        assert_eq!(normalize_address("hello_fn"), None);
        assert_eq!(normalize_address("0xzz"), None);
        assert_eq!(normalize_address(""), None);
        assert_eq!(normalize_address("   "), None);
    }

    #[test]
    fn numeric_values_skip_the_heuristic() {
        assert_eq!(
            AddressValue::Number(0x800C3A40).normalize().as_deref(),
            Some("0x800C3A40")
        );
        assert_eq!(
            AddressValue::Text("2148154944".to_string())
                .normalize()
                .as_deref(),
            Some("0x800A3E40")
        );
    }

    #[test]
    fn address_value_accepts_both_json_shapes() {
        let number: AddressValue = serde_json::from_str("2148154944").expect("number");
        assert_eq!(number, AddressValue::Number(2148154944));
        let text: AddressValue = serde_json::from_str("\"0x800c3a40\"").expect("text");
        assert_eq!(text, AddressValue::Text("0x800c3a40".to_string()));
    }

    #[test]
    fn pr_number_comes_from_pull_segment() {
        assert_eq!(
            pr_number_from_url("https://github.com/org/repo/pull/1234"),
            Some(1234)
        );
        assert_eq!(
            pr_number_from_url("https://github.com/org/repo/pull/1234/files"),
            Some(1234)
        );
        assert_eq!(pr_number_from_url("https://github.com/org/repo"), None);
    }
}
