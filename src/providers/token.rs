//! Token management for 123 Cloud mounts.
//!
//! A mount either owns its credential or references another mount's token
//! manager. Several mounts pointed at the same account share one
//! authenticated session this way: only the owner refreshes, references
//! forward every read and write to it.

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::transport::{envelope_code, ApiRequest, Transport};
use super::ProviderError;
use crate::cloud_config::ConfigStore;

const TOKEN_PATH: &str = "/oauth/access_token";

/// Access/refresh token pair plus the subject of the refresh token
#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    /// `sub` claim of the refresh token, when it could be decoded
    pub subject: Option<String>,
}

impl Credential {
    pub fn new(access_token: &str, refresh_token: &str) -> Self {
        Self {
            access_token: SecretString::from(access_token.to_string()),
            refresh_token: SecretString::from(refresh_token.to_string()),
            subject: decode_subject(refresh_token).ok(),
        }
    }
}

/// How a refreshed token's subject is compared with the previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjectCheck {
    /// Accept any subject
    #[default]
    Relaxed,
    /// Reject a refresh whose subject differs from the known one
    RequireMatch,
}

/// Authoritative credential holder
pub struct OwnedCredential {
    state: RwLock<Credential>,
    client_id: String,
    client_secret: SecretString,
    subject_check: SubjectCheck,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ConfigStore>,
}

enum CredentialLink {
    Owned(OwnedCredential),
    Reference(TokenManager),
}

/// Handle to a mount's credential, owned or delegated
#[derive(Clone)]
pub struct TokenManager {
    link: Arc<CredentialLink>,
}

impl TokenManager {
    /// Create an authoritative token manager
    pub fn owned(
        credential: Credential,
        client_id: &str,
        client_secret: &str,
        subject_check: SubjectCheck,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            link: Arc::new(CredentialLink::Owned(OwnedCredential {
                state: RwLock::new(credential),
                client_id: client_id.to_string(),
                client_secret: SecretString::from(client_secret.to_string()),
                subject_check,
                transport,
                store,
            })),
        }
    }

    /// Create a token manager that forwards everything to `authority`
    pub fn referencing(authority: &TokenManager) -> Self {
        Self {
            link: Arc::new(CredentialLink::Reference(authority.clone())),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(*self.link, CredentialLink::Reference(_))
    }

    /// Follow reference links down to the owning credential.
    pub fn resolve_credential(&self) -> &OwnedCredential {
        let mut current = self;
        loop {
            match &*current.link {
                CredentialLink::Owned(owned) => return owned,
                CredentialLink::Reference(next) => current = next,
            }
        }
    }

    /// Current access token, refreshing first if the owner has none yet.
    pub async fn access_token(&self) -> Result<SecretString, ProviderError> {
        let owned = self.resolve_credential();
        {
            let state = owned.state.read().await;
            if !state.access_token.expose_secret().is_empty() {
                return Ok(state.access_token.clone());
            }
        }
        debug!("[123open] no access token yet, refreshing");
        self.refresh().await?;
        Ok(owned.state.read().await.access_token.clone())
    }

    /// Subject of the current refresh token
    pub async fn subject(&self) -> Option<String> {
        self.resolve_credential().state.read().await.subject.clone()
    }

    /// Exchange the refresh token for a new pair and persist it.
    ///
    /// On any failure the stored credential is left untouched.
    pub async fn refresh(&self) -> Result<(), ProviderError> {
        let owned = self.resolve_credential();
        let (current_refresh, current_subject) = {
            let state = owned.state.read().await;
            (state.refresh_token.clone(), state.subject.clone())
        };

        let body = json!({
            "client_id": owned.client_id,
            "client_secret": owned.client_secret.expose_secret(),
            "grant_type": "refresh_token",
            "refresh_token": current_refresh.expose_secret(),
        });
        let raw = owned
            .transport
            .request(ApiRequest::new(Method::POST, TOKEN_PATH).with_body(body))
            .await
            .map_err(|e| ProviderError::AuthenticationFailed(format!("failed to refresh token: {}", e)))?;

        let (refresh, access) = parse_token_response(&raw)?;
        let new_subject = decode_subject(&refresh)?;

        if owned.subject_check == SubjectCheck::RequireMatch {
            if let Some(ref previous) = current_subject {
                if *previous != new_subject {
                    return Err(ProviderError::AuthenticationFailed(
                        "failed to refresh token: sub not match".to_string(),
                    ));
                }
            }
        }

        // Memory only moves once the new pair is on disk
        owned.store.persist_tokens(&refresh, &access)?;
        {
            let mut state = owned.state.write().await;
            state.access_token = SecretString::from(access);
            state.refresh_token = SecretString::from(refresh);
            state.subject = Some(new_subject);
        }
        info!("[123open] access token refreshed");
        Ok(())
    }
}

/// Pull `(refresh_token, access_token)` out of a token endpoint response.
fn parse_token_response(raw: &[u8]) -> Result<(String, String), ProviderError> {
    let value: Value = serde_json::from_slice(raw).map_err(|e| {
        ProviderError::AuthenticationFailed(format!("failed to refresh token: invalid response: {}", e))
    })?;
    if envelope_code(&value).is_some() {
        let message = value.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(ProviderError::AuthenticationFailed(format!("failed to refresh token: {}", message)));
    }

    let fields = match value.get("data") {
        Some(data) if data.is_object() => data,
        _ => &value,
    };
    let read = |key: &str| fields.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    let refresh = read("refresh_token");
    let access = read("access_token");
    if refresh.is_empty() {
        return Err(ProviderError::AuthenticationFailed(
            "failed to refresh token: refresh token is empty".to_string(),
        ));
    }
    Ok((refresh, access))
}

/// Decode the `sub` claim from a JWT without verifying its signature.
pub fn decode_subject(token: &str) -> Result<String, ProviderError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(ProviderError::AuthenticationFailed(
            "not a jwt token because of invalid segments".to_string(),
        ));
    }
    let payload = segments[1].trim_end_matches('=');
    let bytes = STANDARD_NO_PAD
        .decode(payload)
        .or_else(|_| URL_SAFE_NO_PAD.decode(payload))
        .map_err(|_| ProviderError::AuthenticationFailed("failed to decode jwt token".to_string()))?;
    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|_| ProviderError::AuthenticationFailed("failed to decode jwt token".to_string()))?;

    Ok(match claims.get("sub") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud_config::MemoryConfigStore;
    use crate::providers::testing::{jwt_with_sub, MockTransport};
    use crate::providers::Open123Config;

    struct ReadOnlyStore;

    impl ConfigStore for ReadOnlyStore {
        fn load(&self) -> Result<Open123Config, ProviderError> {
            Ok(Open123Config::new("id", "secret"))
        }

        fn save(&self, _config: &Open123Config) -> Result<(), ProviderError> {
            Err(ProviderError::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only config",
            )))
        }
    }

    fn store() -> Arc<MemoryConfigStore> {
        Arc::new(MemoryConfigStore::new(Open123Config::new("id", "secret")))
    }

    fn owner(mock: &Arc<MockTransport>, store: &Arc<MemoryConfigStore>, access: &str, check: SubjectCheck) -> TokenManager {
        TokenManager::owned(
            Credential::new(access, &jwt_with_sub("user-1")),
            "id",
            "secret",
            check,
            mock.clone(),
            store.clone(),
        )
    }

    #[test]
    fn test_decode_subject() {
        assert_eq!(decode_subject(&jwt_with_sub("42")).unwrap(), "42");
        assert!(matches!(
            decode_subject("only.two"),
            Err(ProviderError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            decode_subject("a.!!!.c"),
            Err(ProviderError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_stores_and_persists_tokens() {
        let mock = Arc::new(MockTransport::new());
        let store = store();
        let new_refresh = jwt_with_sub("user-1");
        mock.respond(TOKEN_PATH, json!({"refresh_token": new_refresh, "access_token": "fresh"}));

        let tokens = owner(&mock, &store, "stale", SubjectCheck::Relaxed);
        tokens.refresh().await.unwrap();

        assert_eq!(tokens.access_token().await.unwrap().expose_secret(), "fresh");
        let saved = store.snapshot();
        assert_eq!(saved.access_token, "fresh");
        assert_eq!(saved.refresh_token, new_refresh);

        let body = &mock.bodies(TOKEN_PATH)[0];
        assert_eq!(body["grant_type"], "refresh_token");
        assert_eq!(body["client_id"], "id");
    }

    #[tokio::test]
    async fn test_malformed_refresh_token_leaves_credential_untouched() {
        let mock = Arc::new(MockTransport::new());
        let store = store();
        mock.respond(TOKEN_PATH, json!({"refresh_token": "not-a-jwt", "access_token": "fresh"}));

        let tokens = owner(&mock, &store, "stale", SubjectCheck::Relaxed);
        let err = tokens.refresh().await.unwrap_err();

        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
        assert_eq!(tokens.access_token().await.unwrap().expose_secret(), "stale");
        assert_eq!(tokens.subject().await.as_deref(), Some("user-1"));
        assert_eq!(store.snapshot().access_token, "");
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_previous_tokens_live() {
        let mock = Arc::new(MockTransport::new());
        mock.respond(TOKEN_PATH, json!({"refresh_token": jwt_with_sub("user-2"), "access_token": "fresh"}));
        let tokens = TokenManager::owned(
            Credential::new("stale", &jwt_with_sub("user-1")),
            "id",
            "secret",
            SubjectCheck::Relaxed,
            mock.clone(),
            Arc::new(ReadOnlyStore),
        );

        let err = tokens.refresh().await.unwrap_err();
        assert!(matches!(err, ProviderError::IoError(_)));
        assert_eq!(tokens.access_token().await.unwrap().expose_secret(), "stale");
        assert_eq!(tokens.subject().await.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_empty_refresh_token_and_backend_error_fail() {
        let mock = Arc::new(MockTransport::new());
        let store = store();
        mock.respond(TOKEN_PATH, json!({"refresh_token": "", "access_token": "fresh"}));
        mock.respond(TOKEN_PATH, json!({"code": "invalid_client", "message": "bad secret"}));

        let tokens = owner(&mock, &store, "stale", SubjectCheck::Relaxed);
        assert!(matches!(tokens.refresh().await, Err(ProviderError::AuthenticationFailed(_))));
        let err = tokens.refresh().await.unwrap_err();
        assert!(err.to_string().contains("bad secret"));
    }

    #[tokio::test]
    async fn test_subject_check_is_configurable() {
        let mock = Arc::new(MockTransport::new());
        let store = store();
        mock.respond(TOKEN_PATH, json!({"refresh_token": jwt_with_sub("user-2"), "access_token": "a"}));
        mock.respond(TOKEN_PATH, json!({"refresh_token": jwt_with_sub("user-2"), "access_token": "b"}));

        let strict = owner(&mock, &store, "stale", SubjectCheck::RequireMatch);
        assert!(matches!(strict.refresh().await, Err(ProviderError::AuthenticationFailed(_))));

        let relaxed = owner(&mock, &store, "stale", SubjectCheck::Relaxed);
        relaxed.refresh().await.unwrap();
        assert_eq!(relaxed.subject().await.as_deref(), Some("user-2"));
    }

    #[tokio::test]
    async fn test_reference_forwards_to_owner() {
        let mock = Arc::new(MockTransport::new());
        let store = store();
        mock.respond(TOKEN_PATH, json!({"refresh_token": jwt_with_sub("user-1"), "access_token": "second"}));

        let authority = owner(&mock, &store, "first", SubjectCheck::Relaxed);
        let reference = TokenManager::referencing(&authority);
        let nested = TokenManager::referencing(&reference);
        assert!(nested.is_reference());
        assert_eq!(nested.access_token().await.unwrap().expose_secret(), "first");

        authority.refresh().await.unwrap();
        assert_eq!(reference.access_token().await.unwrap().expose_secret(), "second");
        assert_eq!(nested.access_token().await.unwrap().expose_secret(), "second");
    }

    #[tokio::test]
    async fn test_empty_access_token_triggers_refresh() {
        let mock = Arc::new(MockTransport::new());
        let store = store();
        mock.respond(TOKEN_PATH, json!({"data": {"refresh_token": jwt_with_sub("user-1"), "access_token": "minted"}}));

        let tokens = owner(&mock, &store, "", SubjectCheck::Relaxed);
        assert_eq!(tokens.access_token().await.unwrap().expose_secret(), "minted");
        assert_eq!(mock.count(TOKEN_PATH), 1);
    }
}
