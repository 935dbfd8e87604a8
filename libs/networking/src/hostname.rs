use crate::NetworkError;

/// Upper bound on a normalized hostname.
pub const MAX_HOSTNAME_LEN: usize = 255;

/// Lowercases `raw` and drops every character outside `[a-z0-9-]`.
///
/// Fails when nothing survives or the result exceeds `max_len`.
pub fn sanitize_hostname(raw: &str, max_len: usize) -> Result<String, NetworkError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if cleaned.is_empty() || cleaned.len() > max_len {
        return Err(NetworkError::InvalidHostname {
            raw: raw.to_owned(),
            max: max_len,
        });
    }
    Ok(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Edge-Site-master", "edge-site-master")]
    #[case("cloud_1-node 2", "cloud1-node2")]
    #[case("ÁNODE-1", "node-1")]
    fn test_normalizes(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(sanitize_hostname(raw, MAX_HOSTNAME_LEN).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("___")]
    #[case("***.***")]
    fn test_rejects_empty_result(#[case] raw: &str) {
        assert!(sanitize_hostname(raw, MAX_HOSTNAME_LEN).is_err());
    }

    #[test]
    fn test_rejects_too_long() {
        let raw = "a".repeat(MAX_HOSTNAME_LEN + 1);
        assert!(matches!(
            sanitize_hostname(&raw, MAX_HOSTNAME_LEN),
            Err(NetworkError::InvalidHostname { .. })
        ));
        assert!(sanitize_hostname(&raw[1..], MAX_HOSTNAME_LEN).is_ok());
    }
}
