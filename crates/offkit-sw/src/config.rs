//! Worker configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::RequestKey;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid origin {origin:?}: {reason}")]
    InvalidOrigin { origin: String, reason: String },

    #[error("Cache name must not be empty")]
    EmptyCacheName,

    #[error("Invalid asset {asset:?}: {reason}")]
    InvalidAsset { asset: String, reason: String },
}

/// Assets written to the cache at install time, in order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest(Vec<String>);

impl AssetManifest {
    pub fn new<I, S>(assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(assets.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve entries against `base`, keeping order and dropping
    /// duplicates.
    pub fn resolve(&self, base: &Url) -> Result<Vec<Url>, ConfigError> {
        let mut urls: Vec<Url> = Vec::with_capacity(self.0.len());
        for asset in &self.0 {
            let url = base.join(asset).map_err(|e| ConfigError::InvalidAsset {
                asset: asset.clone(),
                reason: e.to_string(),
            })?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        Ok(urls)
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name of the active cache; bump it to ship a new version.
    pub cache_name: String,

    /// Application root URL. Its origin decides same-origin requests and
    /// relative entries resolve against it.
    pub origin: String,

    /// Where navigations are cached, relative to `origin`.
    pub navigation_key: String,

    /// Assets seeded at install time.
    pub assets: AssetManifest,

    /// Upper bound on each network fetch; `None` waits indefinitely.
    pub fetch_timeout_ms: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_name: "offkit-cache-v1".to_string(),
            origin: "http://localhost/".to_string(),
            navigation_key: "./index.html".to_string(),
            assets: AssetManifest::new([
                "./",
                "./index.html",
                "./assets/logo.png",
                "./manifest.webmanifest",
            ]),
            fetch_timeout_ms: Some(30_000),
        }
    }
}

impl WorkerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_name.trim().is_empty() {
            return Err(ConfigError::EmptyCacheName);
        }
        let base = self.origin_url()?;
        self.assets.resolve(&base)?;
        self.navigation_url()?;
        Ok(())
    }

    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.origin).map_err(|e| ConfigError::InvalidOrigin {
            origin: self.origin.clone(),
            reason: e.to_string(),
        })?;
        if !url.origin().is_tuple() {
            return Err(ConfigError::InvalidOrigin {
                origin: self.origin.clone(),
                reason: "opaque origin".to_string(),
            });
        }
        Ok(url)
    }

    pub fn navigation_url(&self) -> Result<Url, ConfigError> {
        self.origin_url()?
            .join(&self.navigation_key)
            .map_err(|e| ConfigError::InvalidAsset {
                asset: self.navigation_key.clone(),
                reason: e.to_string(),
            })
    }

    pub fn navigation_request_key(&self) -> Result<RequestKey, ConfigError> {
        Ok(RequestKey::for_url(&self.navigation_url()?))
    }

    pub fn resolved_assets(&self) -> Result<Vec<Url>, ConfigError> {
        self.assets.resolve(&self.origin_url()?)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }
}
