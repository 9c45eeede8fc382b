use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::CredentialError;

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Where the monitoring/provisioning credentials come from.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialSource {
    Inline(serde_json::Value),
    File(PathBuf),
    /// Ambient identity of the machine we run on.
    MetadataServer,
}

impl CredentialSource {
    /// JSON first; anything that does not parse is taken as a key file path.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => CredentialSource::Inline(value),
            Err(_) => {
                debug!("credentials are not inline JSON, treating them as a file path");
                CredentialSource::File(PathBuf::from(text.trim()))
            }
        }
    }

    /// Explicit setting, then `GOOGLE_APPLICATION_CREDENTIALS`, then the metadata server.
    pub fn discover(explicit: Option<&str>) -> Self {
        if let Some(text) = explicit.filter(|t| !t.trim().is_empty()) {
            return Self::parse(text);
        }
        match std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            Ok(path) if !path.is_empty() => CredentialSource::File(PathBuf::from(path)),
            _ => CredentialSource::MetadataServer,
        }
    }

    pub async fn service_account_key(&self) -> Result<Option<ServiceAccountKey>, CredentialError> {
        match self {
            CredentialSource::Inline(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            CredentialSource::File(path) => {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|source| CredentialError::Read {
                        path: path.display().to_string(),
                        source,
                    })?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            CredentialSource::MetadataServer => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Serialize, PartialEq)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

fn assertion_claims(key: &ServiceAccountKey, now: i64) -> AssertionClaims<'_> {
    AssertionClaims {
        iss: &key.client_email,
        scope: CLOUD_PLATFORM_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + 3600,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: i64,
}

fn default_expiry() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: chrono::DateTime<Utc>,
}

/// OAuth2 access tokens for Google APIs, cached until shortly before expiry.
pub struct TokenProvider {
    http: reqwest::Client,
    source: CredentialSource,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(http: reqwest::Client, source: CredentialSource) -> Self {
        Self {
            http,
            source,
            cached: Mutex::new(None),
        }
    }

    pub async fn access_token(&self) -> Result<String, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at - Duration::seconds(60) > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let response = match self.source.service_account_key().await? {
            Some(key) => self.exchange_assertion(&key).await?,
            None => self.metadata_token().await?,
        };
        info!("Obtained access token valid for {}s", response.expires_in);

        let value = response.access_token.clone();
        *cached = Some(CachedToken {
            value: response.access_token,
            expires_at: Utc::now() + Duration::seconds(response.expires_in),
        });
        Ok(value)
    }

    async fn exchange_assertion(&self, key: &ServiceAccountKey) -> Result<TokenResponse, CredentialError> {
        let claims = assertion_claims(key, Utc::now().timestamp());
        let assertion = encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &EncodingKey::from_rsa_pem(key.private_key.as_bytes())?,
        )?;

        let response = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        read_token(response).await
    }

    async fn metadata_token(&self) -> Result<TokenResponse, CredentialError> {
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        read_token(response).await
    }
}

async fn read_token(response: reqwest::Response) -> Result<TokenResponse, CredentialError> {
    let status = response.status();
    if !status.is_success() {
        return Err(CredentialError::Token {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        });
    }
    Ok(response.json::<TokenResponse>().await?)
}
