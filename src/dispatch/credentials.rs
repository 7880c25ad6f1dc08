use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{CredentialMode, DispatchConfig};
use crate::error::DispatchError;

/// Supplies the bearer token for a downstream audience. `None` means the
/// request goes out unauthenticated.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self, audience: &str) -> Result<Option<String>, DispatchError>;
}

/// Identity tokens from the instance metadata server, cached per audience.
#[derive(Debug, Clone)]
pub struct MetadataServerCredentials {
    client: reqwest::Client,
    metadata_url: String,
    cache: Cache<String, String>,
}

impl MetadataServerCredentials {
    pub fn new(metadata_url: impl Into<String>, timeout: Duration, ttl: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let cache = Cache::builder()
            .max_capacity(256)
            .time_to_live(ttl)
            .build();
        Ok(Self {
            client,
            metadata_url: metadata_url.into(),
            cache,
        })
    }

    async fn fetch(&self, audience: &str) -> Result<String, DispatchError> {
        let credential_error = |reason: String| DispatchError::Credential {
            audience: audience.to_string(),
            reason,
        };

        let response = self
            .client
            .get(&self.metadata_url)
            .query(&[("audience", audience), ("format", "full")])
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| credential_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(credential_error(format!("metadata server returned {status}")));
        }

        let token = response
            .text()
            .await
            .map_err(|e| credential_error(e.to_string()))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(credential_error("metadata server returned an empty token".into()));
        }
        Ok(token.to_string())
    }
}

#[async_trait]
impl CredentialProvider for MetadataServerCredentials {
    async fn get_token(&self, audience: &str) -> Result<Option<String>, DispatchError> {
        if let Some(token) = self.cache.get(audience).await {
            debug!(audience, "Identity token cache hit");
            return Ok(Some(token));
        }

        let token = self.fetch(audience).await?;
        self.cache.insert(audience.to_string(), token.clone()).await;
        debug!(audience, "Fetched identity token");
        Ok(Some(token))
    }
}

#[derive(Debug, Clone)]
pub struct StaticTokenCredentials {
    token: String,
}

impl StaticTokenCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenCredentials {
    async fn get_token(&self, _audience: &str) -> Result<Option<String>, DispatchError> {
        Ok(Some(self.token.clone()))
    }
}

/// For local entry points that take no auth.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousCredentials;

#[async_trait]
impl CredentialProvider for AnonymousCredentials {
    async fn get_token(&self, _audience: &str) -> Result<Option<String>, DispatchError> {
        Ok(None)
    }
}

pub fn from_config(config: &DispatchConfig) -> Result<Arc<dyn CredentialProvider>, DispatchError> {
    let provider: Arc<dyn CredentialProvider> = match config.credentials {
        CredentialMode::MetadataServer => Arc::new(MetadataServerCredentials::new(
            config.metadata_url.clone(),
            Duration::from_secs(config.metadata_timeout_secs),
            Duration::from_secs(config.token_cache_ttl_secs),
        )?),
        CredentialMode::StaticToken => {
            let token = config.static_token.clone().ok_or_else(|| DispatchError::Credential {
                audience: "*".to_string(),
                reason: "static_token mode without dispatch.static_token".to_string(),
            })?;
            Arc::new(StaticTokenCredentials::new(token))
        }
        CredentialMode::None => Arc::new(AnonymousCredentials),
    };
    Ok(provider)
}
