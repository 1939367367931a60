//! App access tokens via the OAuth client-credentials grant.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Mutex;

use crate::http::{Credential, CredentialRefresher, RequestBody, RequestDispatcher, RetryPolicy};

pub const DEFAULT_OAUTH_URL: &str = "https://id.twitch.tv";
pub const TOKEN_ENDPOINT: &str = "/oauth2/token";

/// Token endpoint response.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct AppAccessToken {
    pub access_token: String,
    pub expires_in: u64,
    pub token_type: String,
}

#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"****")
            .finish()
    }
}

/// Exchanges a client ID and secret for an app access token.
///
/// Also usable as a dispatcher's [`CredentialRefresher`]: each refresh fetches a
/// new token.
pub struct AppTokenClient {
    credentials: ClientCredentials,
    dispatcher: Mutex<RequestDispatcher>,
}

impl AppTokenClient {
    #[tracing::instrument(skip(credentials, oauth_url))]
    pub fn new(credentials: ClientCredentials, oauth_url: Option<String>) -> Result<Self> {
        let oauth_url = oauth_url.unwrap_or_else(|| DEFAULT_OAUTH_URL.to_string());
        let mut dispatcher = RequestDispatcher::new(&oauth_url)?;
        // Rejected credentials won't succeed on retry
        dispatcher.set_retry_policy(RetryPolicy {
            non_retryable_statuses: vec![400, 401, 403],
            ..Default::default()
        });
        Ok(Self::with_dispatcher(credentials, dispatcher))
    }

    pub fn with_dispatcher(credentials: ClientCredentials, dispatcher: RequestDispatcher) -> Self {
        Self {
            credentials,
            dispatcher: Mutex::new(dispatcher),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.credentials.client_id
    }

    /// Requests an app access token with the client-credentials grant.
    #[tracing::instrument(skip(self))]
    pub async fn fetch_token(&self) -> Result<AppAccessToken> {
        if self.credentials.client_id.is_empty() || self.credentials.client_secret.is_empty() {
            bail!("Client ID and client secret are required to fetch an app access token");
        }

        debug!("Fetching app access token for client {}...", self.credentials.client_id);

        let params = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("grant_type", "client_credentials"),
        ];

        let mut dispatcher = self.dispatcher.lock().await;
        let result = dispatcher
            .post(TOKEN_ENDPOINT, &params, RequestBody::Empty, &[])
            .await
            .context("Failed to fetch app access token")?;

        result
            .json::<AppAccessToken>()
            .context("Failed to parse token response")
    }
}

#[async_trait]
impl CredentialRefresher for AppTokenClient {
    async fn refresh(&self) -> Result<Option<Credential>> {
        let token = self.fetch_token().await?;
        Ok(Some(Credential::new(token.access_token)))
    }
}
