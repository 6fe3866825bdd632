//! Identity verifier (component C2): validates a client-supplied bearer
//! token against an external identity provider and returns a stable login.
//!
//! Grounded in `bore-server::backend::BackendClient`: a `reqwest::Client`
//! with a fixed timeout, a typed JSON response, and a disabled/fallback
//! mode for local development. Unlike that backend's API-key-validation
//! POST, the identity provider here is queried with a `GET` carrying an
//! `Authorization: token <prefix><token>` header (spec §4.2).

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AuthError;

/// A verified user.
#[derive(Debug, Clone)]
pub struct User {
    pub login: String,
    pub allowed: bool,
}

/// The identity provider's JSON profile (spec §4.2 / SPEC_FULL §3).
#[derive(Debug, Deserialize)]
struct ProviderProfile {
    #[allow(dead_code)]
    id: serde_json::Value,
    login: String,
    #[allow(dead_code)]
    created_at: Option<String>,
}

pub struct IdentityVerifier {
    http: Client,
    endpoint: String,
    token_prefix: String,
}

impl IdentityVerifier {
    pub fn new(endpoint: String, token_prefix: String, timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build identity verifier HTTP client");
        IdentityVerifier {
            http,
            endpoint,
            token_prefix,
        }
    }

    /// Consults the identity provider. Any non-2xx, transport error, or
    /// decode error maps to `AuthError::Invalid`; never retried.
    pub async fn authenticate(&self, token: &str) -> Result<User, AuthError> {
        let response = self
            .http
            .get(&self.endpoint)
            .header(
                "Authorization",
                format!("token {}{}", self.token_prefix, token),
            )
            .send()
            .await
            .map_err(|err| {
                warn!(%err, "identity provider request failed");
                AuthError::Invalid
            })?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "identity provider rejected token");
            return Err(AuthError::Invalid);
        }

        let profile: ProviderProfile = response.json().await.map_err(|err| {
            warn!(%err, "identity provider returned an unparseable body");
            AuthError::Invalid
        })?;

        Ok(User {
            login: profile.login.to_lowercase(),
            allowed: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_is_lowercased() {
        // Direct construction; the network call itself is exercised against
        // a local mock server by control::tests in src/control.rs.
        let user = User {
            login: "Alice".to_lowercase(),
            allowed: true,
        };
        assert_eq!(user.login, "alice");
    }
}
