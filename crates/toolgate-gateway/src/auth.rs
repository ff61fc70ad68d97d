//! API key extraction and credential scrubbing

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use std::borrow::Cow;
use std::sync::LazyLock;
use tracing::debug;

use toolgate_core::ApiKey;
use toolgate_store::Policy;

use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Pull an API key from `Authorization: Bearer`, `x-api-key` or `?api_key=`,
/// in that order
pub fn extract_api_key(headers: &HeaderMap, query_key: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let header = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());

    bearer
        .or(header)
        .or(query_key)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// Resolve the presented key to an active API key, or 401
pub async fn authenticate(policy: &Policy, key: Option<String>) -> Result<ApiKey, ApiError> {
    let Some(key) = key else {
        debug!("Rejected request without an API key");
        return Err(ApiError::unauthorized("Missing API key"));
    };
    match policy.verify_api_key(&key).await? {
        Some(api_key) => Ok(api_key),
        None => {
            debug!("Rejected request with an invalid API key");
            Err(ApiError::unauthorized("Invalid or inactive API key"))
        }
    }
}

/// Like [`authenticate`], then 403 unless the key carries `admin_role`
pub async fn authorize_admin(
    policy: &Policy,
    key: Option<String>,
    admin_role: &str,
) -> Result<ApiKey, ApiError> {
    let api_key = authenticate(policy, key).await?;
    if api_key.role != admin_role {
        debug!("Key '{}' with role '{}' denied admin access", api_key.name, api_key.role);
        return Err(ApiError::forbidden(format!(
            "Role '{}' may not use the admin API",
            api_key.role
        )));
    }
    Ok(api_key)
}

static CREDENTIAL_PATTERNS: LazyLock<Vec<(regex::Regex, &'static str)>> = LazyLock::new(|| {
    [
        ("tg_[a-zA-Z0-9_]{16,}", "[REDACTED_API_KEY]"),
        ("sk-[a-zA-Z0-9]{20,}", "[REDACTED_API_KEY]"),
        ("key-[a-zA-Z0-9]{20,}", "[REDACTED_API_KEY]"),
        ("Bearer [a-zA-Z0-9._\\-]{20,}", "Bearer [REDACTED]"),
        ("[a-fA-F0-9]{40,}", "[REDACTED_TOKEN]"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| {
        regex::Regex::new(pattern)
            .ok()
            .map(|re| (re, replacement))
    })
    .collect()
});

/// Scrub API keys and tokens out of text before it is persisted.
/// Downstream servers sometimes echo credentials back in error messages.
pub fn redact_credentials(text: &str) -> String {
    let mut result: Cow<'_, str> = Cow::Borrowed(text);
    for (re, replacement) in CREDENTIAL_PATTERNS.iter() {
        if let Cow::Owned(s) = re.replace_all(&result, *replacement) {
            result = Cow::Owned(s);
        }
    }
    result.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use toolgate_core::PolicyEvaluation;
    use toolgate_store::Database;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_extract_precedence() {
        let h = headers(&[("authorization", "Bearer from-bearer"), ("x-api-key", "from-header")]);
        assert_eq!(extract_api_key(&h, Some("from-query")).as_deref(), Some("from-bearer"));

        let h = headers(&[("x-api-key", "from-header")]);
        assert_eq!(extract_api_key(&h, Some("from-query")).as_deref(), Some("from-header"));

        assert_eq!(
            extract_api_key(&HeaderMap::new(), Some("from-query")).as_deref(),
            Some("from-query")
        );
        assert_eq!(extract_api_key(&HeaderMap::new(), None), None);
    }

    #[test]
    fn test_extract_ignores_other_schemes_and_blanks() {
        let h = headers(&[("authorization", "Basic dXNlcjpwYXNz")]);
        assert_eq!(extract_api_key(&h, None), None);
        assert_eq!(extract_api_key(&HeaderMap::new(), Some("  ")), None);
    }

    #[tokio::test]
    async fn test_authenticate_and_admin() {
        let policy = Policy::new(Database::open_in_memory().unwrap(), PolicyEvaluation::AllowOnly);
        policy.bootstrap("admin", "tg_admin_test_key").await.unwrap();
        let analyst = policy.create_api_key("bot", "analyst").await.unwrap();

        let err = authenticate(&policy, None).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);
        let err = authenticate(&policy, Some("tg_nope".into())).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::UNAUTHORIZED);

        let key = authenticate(&policy, Some(analyst.clone())).await.unwrap();
        assert_eq!(key.role, "analyst");

        let err = authorize_admin(&policy, Some(analyst), "admin").await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::FORBIDDEN);
        let admin = authorize_admin(&policy, Some("tg_admin_test_key".into()), "admin")
            .await
            .unwrap();
        assert_eq!(admin.role, "admin");
    }

    #[test]
    fn test_redact_keys_and_tokens() {
        let text = "upstream said: bad key tg_0123456789abcdef0123 and Bearer eyJhbGciOiJIUzI1NiIsInR5cCI6";
        let redacted = redact_credentials(text);
        assert!(!redacted.contains("tg_0123456789abcdef0123"));
        assert!(redacted.contains("[REDACTED_API_KEY]"));
        assert!(redacted.contains("Bearer [REDACTED]"));
        assert!(redacted.starts_with("upstream said"));
    }

    #[test]
    fn test_redact_leaves_plain_text() {
        assert_eq!(redact_credentials("connection refused"), "connection refused");
    }
}
