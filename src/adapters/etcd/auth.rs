//! Request credentials.
//!
//! etcd clients send the token returned by `Authenticate` in the `token`
//! metadata entry; some send it as `authorization` instead, optionally with
//! a `Bearer` scheme.

/// Metadata keys carrying credentials.
pub mod metadata_keys {
    pub const TOKEN: &str = "token";
    pub const AUTHORIZATION: &str = "authorization";
}

/// Pick the token out of the two metadata values. `token` wins when both
/// are present. Blank values count as absent.
pub fn extract_token(token: Option<&str>, authorization: Option<&str>) -> Option<String> {
    let from_token = token.map(str::trim).filter(|t| !t.is_empty());
    let from_authorization = authorization
        .map(str::trim)
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .filter(|t| !t.is_empty());
    from_token.or(from_authorization).map(str::to_string)
}

/// Credentials pulled from tonic request metadata.
#[cfg(feature = "grpc")]
pub fn token_from_metadata(metadata: &tonic::metadata::MetadataMap) -> Option<String> {
    let get = |key: &str| metadata.get(key).and_then(|v| v.to_str().ok());
    extract_token(get(metadata_keys::TOKEN), get(metadata_keys::AUTHORIZATION))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_entry_wins() {
        assert_eq!(
            extract_token(Some("abc"), Some("Bearer xyz")).as_deref(),
            Some("abc")
        );
    }

    #[test]
    fn authorization_strips_bearer_scheme() {
        assert_eq!(extract_token(None, Some("Bearer xyz")).as_deref(), Some("xyz"));
        assert_eq!(extract_token(None, Some("xyz")).as_deref(), Some("xyz"));
    }

    #[test]
    fn blank_values_are_absent() {
        assert_eq!(extract_token(Some("  "), None), None);
        assert_eq!(extract_token(None, Some("Bearer ")), None);
    }
}
