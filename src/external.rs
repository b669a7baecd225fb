use crate::error::{AuthError, CredentialError};
use async_trait::async_trait;
use std::collections::HashMap;

/// fetches credentials for a `credential_ref` (e.g. from a secret store).
/// The real credential store is out of scope; only the boundary trait and a
/// thin HTTP-backed default live here. Grounded on
/// `original_source/trilio_dms/services/secret_manager.py`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(
        &self,
        credential_ref: &str,
        token: &str,
    ) -> Result<HashMap<String, String>, CredentialError>;
}

/// verifies a caller-supplied auth token. Real token issuance/verification is
/// out of scope; only the boundary trait and a no-op default live here.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<(), AuthError>;
}

/// accepts any non-empty token. Suitable for local/dev use when no real
/// token issuer is configured.
pub struct NullTokenVerifier;

#[async_trait]
impl TokenVerifier for NullTokenVerifier {
    async fn verify(&self, token: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::Rejected("empty token".into()));
        }
        Ok(())
    }
}

/// fetches credentials from an HTTP JSON endpoint:
/// `GET {base_url}/{credential_ref}` with a bearer token.
pub struct HttpCredentialSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCredentialSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(
        &self,
        credential_ref: &str,
        token: &str,
    ) -> Result<HashMap<String, String>, CredentialError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), credential_ref);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;

        let credentials: HashMap<String, String> = resp.json().await?;
        Ok(credentials)
    }
}
