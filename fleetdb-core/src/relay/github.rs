//! GitHub-backed relay client
//!
//! Direct REST integration:
//! - `POST /app/installations/{id}/access_tokens` with an RS256 app JWT
//! - `POST /repos/{owner}/{repo}/dispatches` with the installation token

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{truncate_body, Relay};
use crate::error::{DataError, DataResult};
use crate::token::{AppIdentity, CredentialIssuer, IssuedCredential};
use crate::types::{InstanceId, Param};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";

const USER_AGENT: &str = concat!("fleetdb/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "application/vnd.github+json";
const API_VERSION: &str = "2022-11-28";

/// GitHub rejects app JWTs that live longer than ten minutes
const APP_JWT_LIFETIME_SECS: i64 = 9 * 60;
/// Backdated to tolerate clock drift between us and GitHub
const APP_JWT_BACKDATE_SECS: i64 = 60;

fn build_client() -> DataResult<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .map_err(|err| DataError::configuration(format!("failed to build HTTP client: {err}")))
}

#[derive(Debug, Serialize)]
struct AppClaims<'a> {
    iat: i64,
    exp: i64,
    iss: &'a str,
}

/// Signs the short-lived JWT that authenticates as the GitHub App itself
fn app_jwt(identity: &AppIdentity, now: DateTime<Utc>) -> DataResult<String> {
    let key = EncodingKey::from_rsa_pem(identity.private_key.as_bytes())
        .map_err(|err| DataError::configuration(format!("invalid relay signing key: {err}")))?;
    let now = now.timestamp();
    let claims = AppClaims {
        iat: now - APP_JWT_BACKDATE_SECS,
        exp: now + APP_JWT_LIFETIME_SECS,
        iss: &identity.app_id,
    };
    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|err| DataError::credential(format!("failed to sign app JWT: {err}")))
}

/// Issues GitHub App installation tokens
pub struct GithubAppIssuer {
    client: Client,
    api_base: String,
}

impl GithubAppIssuer {
    pub fn new(api_base: impl Into<String>) -> DataResult<Self> {
        Ok(Self {
            client: build_client()?,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[async_trait]
impl CredentialIssuer for GithubAppIssuer {
    async fn issue(&self, identity: &AppIdentity) -> DataResult<IssuedCredential> {
        let jwt = app_jwt(identity, Utc::now())?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, identity.installation_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(|err| DataError::credential(format!("installation token request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DataError::credential(format!(
                "installation token request rejected ({status}): {}",
                truncate_body(&body)
            )));
        }

        let body: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|err| DataError::credential(format!("invalid installation token response: {err}")))?;

        Ok(IssuedCredential {
            token: body.token,
            expires_at: body.expires_at,
        })
    }
}

/// Where and how replicated statements are dispatched
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    pub owner: String,
    pub repo: String,
    pub event_type: String,
}

/// Relays statements as `repository_dispatch` events
pub struct RepositoryDispatchRelay {
    client: Client,
    api_base: String,
    target: DispatchTarget,
}

impl RepositoryDispatchRelay {
    pub fn new(api_base: impl Into<String>, target: DispatchTarget) -> DataResult<Self> {
        Ok(Self {
            client: build_client()?,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            target,
        })
    }
}

#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    event_type: &'a str,
    client_payload: DispatchPayload<'a>,
}

#[derive(Debug, Serialize)]
struct DispatchPayload<'a> {
    sql: &'a str,
    params: &'a [Param],
    instance: &'a InstanceId,
}

#[async_trait]
impl Relay for RepositoryDispatchRelay {
    async fn relay_statement(
        &self,
        token: &str,
        statement: &str,
        params: &[Param],
        target: &InstanceId,
    ) -> DataResult<()> {
        let url = format!(
            "{}/repos/{}/{}/dispatches",
            self.api_base, self.target.owner, self.target.repo
        );
        let request = DispatchRequest {
            event_type: &self.target.event_type,
            client_payload: DispatchPayload {
                sql: statement,
                params,
                instance: target,
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("Accept", ACCEPT)
            .header("X-GitHub-Api-Version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|err| DataError::replication(target.clone(), format!("dispatch request failed: {err}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DataError::replication(
                target.clone(),
                format!("dispatch rejected ({status}): {}", truncate_body(&body)),
            ));
        }

        Ok(())
    }
}
