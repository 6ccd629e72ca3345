//! Authorization-code + PKCE login flow

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::pkce;
use crate::config::{ApiConfig, AuthConfig};
use crate::credentials::{Credential, CredentialStore, PendingVerifier};
use crate::error::{Error, Result};
use crate::spotify::http_client;
use crate::time::current_time_ms;

/// Where the login handshake currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    /// Verifier stored, waiting for the redirect callback
    PendingExchange,
    Authenticated,
}

/// Successful token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Lifetime in seconds
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Error body returned by the token endpoint on 4xx
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Drives the PKCE handshake and owns token exchange and refresh
pub struct AuthFlow {
    config: AuthConfig,
    store: Arc<CredentialStore>,
    http: reqwest::Client,
    /// Held for the duration of a token request; serializes exchange and refresh
    exchange: tokio::sync::Mutex<()>,
    /// Code already redeemed in this login attempt (duplicate-callback guard)
    redeemed_code: Mutex<Option<String>>,
}

impl AuthFlow {
    pub fn new(config: AuthConfig, api: &ApiConfig, store: Arc<CredentialStore>) -> Result<Self> {
        Ok(Self {
            config,
            store,
            http: http_client(api)?,
            exchange: tokio::sync::Mutex::new(()),
            redeemed_code: Mutex::new(None),
        })
    }

    pub fn state(&self) -> AuthState {
        if self.store.load().is_some() {
            AuthState::Authenticated
        } else if self.store.verifier().is_some() {
            AuthState::PendingExchange
        } else {
            AuthState::Unauthenticated
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.load().is_some()
    }

    /// Start a login attempt and return the URL to send the user to
    ///
    /// Refuses to overwrite the verifier of an attempt that is still waiting
    /// for its callback, unless that attempt is older than the login timeout.
    pub fn begin_login(&self) -> Result<String> {
        let _exchange = self
            .exchange
            .try_lock()
            .map_err(|_| Error::LoginInProgress)?;

        let now = current_time_ms();
        if let Some(pending) = self.store.verifier() {
            let age_ms = now.saturating_sub(pending.created_at_ms);
            if age_ms < self.config.login_timeout().as_millis() as u64 {
                return Err(Error::LoginInProgress);
            }
            info!("Replacing abandoned login attempt ({}s old)", age_ms / 1000);
        }

        let verifier = pkce::generate_verifier();
        let challenge = pkce::challenge_for(&verifier);
        let url = self.authorize_url(&challenge)?;

        self.store.save_verifier(PendingVerifier {
            value: verifier,
            created_at_ms: now,
        })?;
        *self.redeemed_code.lock() = None;

        info!("Login started");
        Ok(url)
    }

    /// Abandon the current login attempt, if any
    pub fn cancel_login(&self) -> Result<()> {
        self.store.discard_verifier()
    }

    /// Exchange an authorization code for a credential
    ///
    /// Calling this again with a code that was already redeemed does not hit
    /// the token endpoint; it returns the stored credential instead.
    #[instrument(skip(self, code))]
    pub async fn complete_login(&self, code: &str) -> Result<Credential> {
        if code.is_empty() {
            return Err(Error::InvalidArgument("empty authorization code".to_string()));
        }

        let _exchange = self.exchange.lock().await;

        if self.redeemed_code.lock().as_deref() == Some(code) {
            debug!("Authorization code already redeemed, skipping exchange");
            return self.store.load().ok_or(Error::Unauthenticated);
        }

        let verifier = self.store.verifier().ok_or(Error::MissingVerifier)?;

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_verifier", verifier.value.as_str()),
        ];

        let token = match self.request_token(&params).await {
            Ok(token) => token,
            Err(e @ Error::ExchangeRejected { .. }) => {
                warn!("Token exchange rejected: {}", e);
                // The code is burnt either way; the next attempt needs a new verifier
                if let Err(discard) = self.store.discard_verifier() {
                    warn!("Failed to discard verifier: {}", discard);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let credential = Credential {
            access_token: token.access_token,
            expires_at_ms: expiry_from_now(token.expires_in),
            refresh_token: token.refresh_token,
        };

        self.store.save(credential.clone())?;
        self.store.discard_verifier()?;
        *self.redeemed_code.lock() = Some(code.to_string());

        info!("Login complete, token valid for {}s", token.expires_in);
        Ok(credential)
    }

    /// Finish a login from the full redirect URL the provider sent back
    pub async fn complete_login_from_redirect(&self, redirect_url: &str) -> Result<Credential> {
        let url = Url::parse(redirect_url)
            .map_err(|e| Error::InvalidArgument(format!("redirect URL: {}", e)))?;

        let mut code = None;
        let mut error = None;
        let mut description = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            warn!("Authorization denied: {}", error);
            self.store.discard_verifier()?;
            return Err(Error::AuthorizationDenied(description.unwrap_or(error)));
        }

        match code {
            Some(code) => self.complete_login(&code).await,
            None => Err(Error::InvalidArgument(
                "redirect URL carries no authorization code".to_string(),
            )),
        }
    }

    /// Trade the stored refresh token for a fresh access token
    ///
    /// A rejected refresh clears the credential so the next step is a login.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Credential> {
        let _exchange = self.exchange.lock().await;

        let refresh_token = self.store.refresh_token().ok_or(Error::Unauthenticated)?;

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];

        let token = match self.request_token(&params).await {
            Ok(token) => token,
            Err(e @ Error::ExchangeRejected { .. }) => {
                warn!("Token refresh rejected: {}", e);
                if let Err(clear) = self.store.clear_credential() {
                    warn!("Failed to clear credential: {}", clear);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let credential = Credential {
            access_token: token.access_token,
            expires_at_ms: expiry_from_now(token.expires_in),
            // Providers may omit the refresh token when it did not rotate
            refresh_token: token.refresh_token.or(Some(refresh_token)),
        };
        self.store.save(credential.clone())?;

        info!("Access token refreshed, valid for {}s", token.expires_in);
        Ok(credential)
    }

    /// Forget the credential, any pending verifier and the redeemed code
    pub fn logout(&self) -> Result<()> {
        *self.redeemed_code.lock() = None;
        self.store.clear()?;
        info!("Logged out");
        Ok(())
    }

    fn authorize_url(&self, challenge: &str) -> Result<String> {
        let scope = self.config.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("code_challenge_method", pkce::CHALLENGE_METHOD),
                ("code_challenge", challenge),
            ],
        )
        .map_err(|e| Error::Config(format!("auth.authorize_url: {}", e)))?;
        Ok(url.to_string())
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let resp = self
            .http
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TokenErrorResponse>(&body)
                .ok()
                .map(|e| e.error_description.unwrap_or(e.error));
            return Err(Error::ExchangeRejected {
                status: status.as_u16(),
                reason,
            });
        }

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| Error::MalformedResponse(format!("token response: {}", e)))
    }
}

fn expiry_from_now(expires_in_secs: u64) -> u64 {
    current_time_ms().saturating_add(expires_in_secs.saturating_mul(1000))
}
