//! Identity directory backed by a Graph-style HTTP API.
//!
//! Lifecycle attributes are custom user attributes named
//! `<extension_prefix><Name>` (`Status`, `Role`, `Username`, `ContainerPort`).
//! Requests authenticate with an OAuth2 client-credentials token that is
//! cached until shortly before it expires.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use provisioning_sdk::{
    DirectoryError, IdentityDirectory, User, UserId, UserPatch, UserRole, UserStatus,
};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::config::DirectoryConfig;

const ATTR_STATUS: &str = "Status";
const ATTR_ROLE: &str = "Role";
const ATTR_USERNAME: &str = "Username";
const ATTR_CONTAINER_PORT: &str = "ContainerPort";

/// Refresh this long before the token's stated expiry.
const TOKEN_REFRESH_OFFSET: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);
const ERROR_BODY_LIMIT: usize = 256;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: SecretString,
    refresh_at: Instant,
}

pub struct GraphDirectory {
    client: reqwest::Client,
    base_url: Url,
    token_url: Url,
    client_id: String,
    client_secret: SecretString,
    scope: String,
    prefix: String,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for GraphDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDirectory")
            .field("base_url", &self.base_url.as_str())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl GraphDirectory {
    /// # Errors
    /// Fails when URLs or credentials are missing or malformed.
    pub fn new(config: &DirectoryConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid directory.base_url '{}'", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("directory.base_url '{}' cannot be a base URL", config.base_url);
        }
        let token_url = Url::parse(&config.token_url)
            .with_context(|| format!("invalid directory.token_url '{}'", config.token_url))?;
        if config.client_id.is_empty() {
            anyhow::bail!("directory.client_id is required");
        }
        let client_secret = config
            .client_secret
            .clone()
            .context("directory.client_secret is required")?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            token_url,
            client_id: config.client_id.clone(),
            client_secret,
            scope: config.scope.clone(),
            prefix: config.extension_prefix.clone(),
            token: Mutex::new(None),
        })
    }

    fn attr(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    fn user_url(&self, id: &UserId) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("users").push(id.as_str());
        }
        url
    }

    async fn bearer(&self) -> Result<String, DirectoryError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.value.expose_secret().to_owned());
        }

        let fresh = self.request_token().await?;
        let value = fresh.value.expose_secret().to_owned();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn request_token(&self) -> Result<CachedToken, DirectoryError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .client
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| DirectoryError::unavailable(format!("token request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            let message = format!("token endpoint returned {status}: {body}");
            return Err(if is_transient(status) {
                DirectoryError::unavailable(message)
            } else {
                DirectoryError::rejected(message)
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| DirectoryError::unavailable(format!("invalid token response: {e}")))?;

        let ttl = token
            .expires_in
            .map_or(DEFAULT_TOKEN_TTL, Duration::from_secs);
        let refresh_in = if ttl > TOKEN_REFRESH_OFFSET * 2 {
            ttl - TOKEN_REFRESH_OFFSET
        } else {
            ttl / 2
        };
        debug!(ttl_secs = ttl.as_secs(), "directory token acquired");

        Ok(CachedToken {
            value: SecretString::from(token.access_token),
            refresh_at: Instant::now() + refresh_in,
        })
    }

    /// Map a non-success API response to a directory error.
    async fn api_error(&self, id: &UserId, response: reqwest::Response) -> DirectoryError {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return DirectoryError::NotFound { id: id.clone() };
        }
        if status == StatusCode::UNAUTHORIZED {
            // Token revoked or rotated server-side; the retry fetches a new one.
            self.invalidate_token().await;
            return DirectoryError::unavailable("directory rejected access token");
        }

        let body = error_body(response).await;
        let message = format!("{status}: {body}");
        if is_transient(status) {
            DirectoryError::unavailable(message)
        } else {
            DirectoryError::rejected(message)
        }
    }

    fn parse_user(&self, id: &UserId, body: &Map<String, Value>) -> Result<User, DirectoryError> {
        let text = |name: &str| body.get(&self.attr(name)).and_then(Value::as_str);

        let status = match text(ATTR_STATUS) {
            None => UserStatus::Pending,
            Some(raw) => UserStatus::from_wire(raw)
                .ok_or_else(|| DirectoryError::rejected(format!("user {id} has unknown status '{raw}'")))?,
        };
        let role = text(ATTR_ROLE)
            .and_then(UserRole::from_wire)
            .unwrap_or_default();

        let container_port = match body.get(&self.attr(ATTR_CONTAINER_PORT)) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(Value::String(s)) => s.parse().ok(),
            Some(other) => {
                warn!(user_id = %id, value = %other, "ignoring malformed container port");
                None
            }
        };

        let email = body
            .get("mail")
            .and_then(Value::as_str)
            .or_else(|| {
                body.get("otherMails")
                    .and_then(Value::as_array)
                    .and_then(|mails| mails.first())
                    .and_then(Value::as_str)
            })
            .map(str::to_owned);

        Ok(User {
            id: id.clone(),
            email,
            username: text(ATTR_USERNAME).map(str::to_owned),
            status,
            role,
            container_port,
        })
    }

    fn patch_body(&self, patch: &UserPatch) -> Map<String, Value> {
        let mut body = Map::new();
        if let Some(status) = patch.status {
            body.insert(self.attr(ATTR_STATUS), Value::from(status.as_str()));
        }
        if let Some(port) = patch.container_port {
            body.insert(
                self.attr(ATTR_CONTAINER_PORT),
                port.map_or(Value::Null, Value::from),
            );
        }
        body
    }
}

#[async_trait]
impl IdentityDirectory for GraphDirectory {
    async fn get_user(&self, id: &UserId) -> Result<User, DirectoryError> {
        let select = [
            "id".to_owned(),
            "mail".to_owned(),
            "otherMails".to_owned(),
            self.attr(ATTR_USERNAME),
            self.attr(ATTR_STATUS),
            self.attr(ATTR_ROLE),
            self.attr(ATTR_CONTAINER_PORT),
        ]
        .join(",");

        let token = self.bearer().await?;
        let response = self
            .client
            .get(self.user_url(id))
            .query(&[("$select", select)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DirectoryError::unavailable(format!("get user {id}: {e}")))?;

        if !response.status().is_success() {
            return Err(self.api_error(id, response).await);
        }

        let body: Map<String, Value> = response
            .json()
            .await
            .map_err(|e| DirectoryError::unavailable(format!("get user {id}: invalid body: {e}")))?;
        self.parse_user(id, &body)
    }

    async fn update_user(&self, id: &UserId, patch: &UserPatch) -> Result<(), DirectoryError> {
        let body = self.patch_body(patch);
        if body.is_empty() {
            return Ok(());
        }

        let token = self.bearer().await?;
        let response = self
            .client
            .patch(self.user_url(id))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| DirectoryError::unavailable(format!("update user {id}: {e}")))?;

        if !response.status().is_success() {
            return Err(self.api_error(id, response).await);
        }
        debug!(user_id = %id, ?patch, "directory record updated");
        Ok(())
    }

    async fn delete_user(&self, id: &UserId) -> Result<(), DirectoryError> {
        let token = self.bearer().await?;
        let response = self
            .client
            .delete(self.user_url(id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| DirectoryError::unavailable(format!("delete user {id}: {e}")))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(self.api_error(id, response).await)
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

async fn error_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
