//! Session configuration

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Configuration for an authentication session
///
/// The configuration is fixed once a session is built. It can be
/// deserialized from JSON using the camel-cased option names; any
/// unrecognized keys are ignored and missing keys take their defaults.
///
/// ```
/// use tessera::AuthConfig;
///
/// let config = AuthConfig::from_json(r#"{ "apiUrl": "/v2", "validateOnPageLoad": false }"#).unwrap();
///
/// assert_eq!(config.sign_in_url(), "/v2/auth/login");
/// assert!(!config.validate_on_page_load());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    api_url: String,
    sign_out_url: String,
    email_sign_in_path: String,
    token_validation_path: String,
    token_refresh_path: String,
    validate_on_page_load: bool,
    token_format: BTreeMap<String, String>,
    storage_key: String,
    #[serde(with = "timeout_secs", skip_serializing_if = "Option::is_none")]
    request_timeout: Option<Duration>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let mut token_format = BTreeMap::new();
        token_format.insert("Authorization".to_owned(), "Bearer {{ token }}".to_owned());

        Self {
            api_url: "/api".to_owned(),
            sign_out_url: "/auth/logout".to_owned(),
            email_sign_in_path: "/auth/login".to_owned(),
            token_validation_path: "/auth/validate".to_owned(),
            token_refresh_path: "/auth/refresh".to_owned(),
            validate_on_page_load: true,
            token_format,
            storage_key: "auth_headers".to_owned(),
            request_timeout: None,
        }
    }
}

impl AuthConfig {
    /// Parses a configuration from a JSON document
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sets the base URL of the protected API
    ///
    /// Requests whose URL contains this value receive the persisted
    /// credentials. Every endpoint path is resolved against it.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Sets the sign-out path
    pub fn with_sign_out_url(mut self, path: impl Into<String>) -> Self {
        self.sign_out_url = path.into();
        self
    }

    /// Sets the email sign-in path
    pub fn with_email_sign_in_path(mut self, path: impl Into<String>) -> Self {
        self.email_sign_in_path = path.into();
        self
    }

    /// Sets the token validation path
    pub fn with_token_validation_path(mut self, path: impl Into<String>) -> Self {
        self.token_validation_path = path.into();
        self
    }

    /// Sets the token refresh path
    pub fn with_token_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.token_refresh_path = path.into();
        self
    }

    /// Sets whether the session validates persisted credentials when started
    pub fn with_validate_on_page_load(mut self, validate: bool) -> Self {
        self.validate_on_page_load = validate;
        self
    }

    /// Replaces the header templates rendered from each issued token
    pub fn with_token_format<I, K, V>(mut self, format: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.token_format = format
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Sets the key under which credentials are persisted
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Bounds every transport call made through the session
    ///
    /// A zero timeout disables the bound.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// The base URL of the protected API
    #[inline]
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// The sign-in path, relative to the API base
    #[inline]
    pub fn email_sign_in_path(&self) -> &str {
        &self.email_sign_in_path
    }

    /// The refresh path, relative to the API base
    #[inline]
    pub fn token_refresh_path(&self) -> &str {
        &self.token_refresh_path
    }

    /// Whether persisted credentials are validated at start-up
    #[inline]
    pub fn validate_on_page_load(&self) -> bool {
        self.validate_on_page_load
    }

    /// Header templates, keyed by header name
    #[inline]
    pub fn token_format(&self) -> &BTreeMap<String, String> {
        &self.token_format
    }

    /// The key under which credentials are persisted
    #[inline]
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// The limit applied to each transport call, if any
    #[inline]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    /// Full URL of the sign-in endpoint
    pub fn sign_in_url(&self) -> String {
        format!("{}{}", self.api_url, self.email_sign_in_path)
    }

    /// Full URL of the sign-out endpoint
    pub fn sign_out_url(&self) -> String {
        format!("{}{}", self.api_url, self.sign_out_url)
    }

    /// Full URL of the token validation endpoint
    pub fn validation_url(&self) -> String {
        format!("{}{}", self.api_url, self.token_validation_path)
    }

    /// Full URL of the token refresh endpoint
    pub fn refresh_url(&self) -> String {
        format!("{}{}", self.api_url, self.token_refresh_path)
    }

    /// Whether a request URL is bound for the protected API
    pub fn is_api_url(&self, url: &str) -> bool {
        url.contains(&self.api_url)
    }

    /// Whether a request URL targets the sign-in endpoint
    pub fn is_sign_in_url(&self, url: &str) -> bool {
        url.contains(&self.email_sign_in_path)
    }

    /// Whether a request URL targets the refresh endpoint
    pub fn is_refresh_url(&self, url: &str) -> bool {
        url.contains(&self.token_refresh_path)
    }
}

/// `requestTimeout` as a number of seconds, fractions allowed
///
/// Zero, negative and non-finite values leave requests unbounded.
mod timeout_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(timeout: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match timeout {
            Some(timeout) => serializer.serialize_f64(timeout.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = AuthConfig::default();

        assert_eq!(config.api_url(), "/api");
        assert_eq!(config.sign_in_url(), "/api/auth/login");
        assert_eq!(config.sign_out_url(), "/api/auth/logout");
        assert_eq!(config.validation_url(), "/api/auth/validate");
        assert_eq!(config.refresh_url(), "/api/auth/refresh");
        assert!(config.validate_on_page_load());
        assert_eq!(
            config.token_format().get("Authorization").map(String::as_str),
            Some("Bearer {{ token }}")
        );
        assert_eq!(config.storage_key(), "auth_headers");
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn unknown_keys_are_ignored_and_missing_keys_defaulted() {
        let config = AuthConfig::from_json(
            r#"{
                "apiUrl": "https://example.com/api",
                "tokenRefreshPath": "/session/renew",
                "tokenFormat": { "X-Token": "{{ token }}" },
                "requestTimeout": 30,
                "somethingElse": [1, 2, 3]
            }"#,
        )
        .unwrap();

        assert_eq!(config.refresh_url(), "https://example.com/api/session/renew");
        assert_eq!(config.sign_in_url(), "https://example.com/api/auth/login");
        assert_eq!(config.token_format().len(), 1);
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn url_classification_uses_substring_matches() {
        let config = AuthConfig::default();

        assert!(config.is_api_url("https://example.com/api/users"));
        assert!(!config.is_api_url("https://example.com/static/app.js"));
        assert!(config.is_sign_in_url("https://example.com/api/auth/login"));
        assert!(config.is_refresh_url("/api/auth/refresh"));
        assert!(!config.is_refresh_url("/api/auth/validate"));
    }

    #[test]
    fn sub_second_timeouts_keep_their_precision() {
        let config = AuthConfig::default().with_request_timeout(Duration::from_millis(500));
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(500)));

        let parsed = AuthConfig::from_json(r#"{ "requestTimeout": 0.25 }"#).unwrap();
        assert_eq!(parsed.request_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn zero_timeouts_leave_requests_unbounded() {
        let config = AuthConfig::default().with_request_timeout(Duration::ZERO);
        assert_eq!(config.request_timeout(), None);

        let parsed = AuthConfig::from_json(r#"{ "requestTimeout": 0 }"#).unwrap();
        assert_eq!(parsed.request_timeout(), None);
    }

    #[test]
    fn builder_overrides_token_format() {
        let config = AuthConfig::default()
            .with_token_format([("X-Auth", "{{ token }}"), ("X-User", "{{ user.id }}")]);

        assert_eq!(config.token_format().len(), 2);
        assert!(config.token_format().get("Authorization").is_none());
    }
}
