//! Engine configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::store::StoreVersion;
use crate::{EngineError, Result};

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Origin the engine serves; precache paths and notification targets
    /// resolve against it
    pub origin: String,

    /// Store name prefix shared by every generation
    pub cache_prefix: String,

    /// Version tag of the current generation; bumping it invalidates every
    /// other store on the next activation
    pub cache_version: String,

    /// Paths fetched into the store at install, in order
    pub precache_urls: Vec<String>,

    /// Host substrings that are never intercepted
    pub bypass_hosts: Vec<String>,

    /// Where a notification click lands when the payload carried no URL
    pub app_root: String,

    /// Notification defaults
    pub notifications: NotificationDefaults,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    /// Title used when the payload has none, or is plain text
    pub title: String,

    /// Icon path
    pub icon: String,

    /// Badge path
    pub badge: String,

    /// Dedup / grouping tag
    pub tag: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8080".to_string(),
            cache_prefix: "kjfc-cache".to_string(),
            cache_version: "kjfc-v1.0.1".to_string(),
            precache_urls: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
            ],
            bypass_hosts: vec![
                "script.google.com".to_string(),
                "googleapis.com".to_string(),
            ],
            app_root: "/".to_string(),
            notifications: NotificationDefaults::default(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "KJFC Dashboard".to_string(),
            icon: "/icons/icon-192.png".to_string(),
            badge: "/icons/icon-192.png".to_string(),
            tag: "kjfc-notification".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            EngineError::Config(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        check_name_part("cache_prefix", &self.cache_prefix)?;
        check_name_part("cache_version", &self.cache_version)?;
        let origin = self.origin_url()?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(EngineError::Config(format!(
                "origin must be http(s), got '{}'",
                origin.scheme()
            )));
        }
        self.precache_manifest()?;
        Ok(())
    }

    /// Parsed origin, normalized to its root path.
    pub fn origin_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.origin)
            .map_err(|e| EngineError::Config(format!("invalid origin '{}': {}", self.origin, e)))?;
        url.set_path("/");
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    /// Version of the current generation.
    pub fn store_version(&self) -> StoreVersion {
        StoreVersion::new(&self.cache_prefix, &self.cache_version)
    }

    /// Precache paths resolved against the origin, in manifest order.
    pub fn precache_manifest(&self) -> Result<Vec<Url>> {
        let origin = self.origin_url()?;
        self.precache_urls
            .iter()
            .map(|path| {
                origin.join(path).map_err(|e| {
                    EngineError::Config(format!("invalid precache entry '{}': {}", path, e))
                })
            })
            .collect()
    }
}

/// Store names double as directory names, so each part is limited to
/// `[A-Za-z0-9._-]`.
fn check_name_part(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(EngineError::Config(format!("{field} must not be empty")));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(EngineError::Config(format!(
            "{field} '{value}' contains {bad:?}; use letters, digits, '.', '-' or '_'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment() {
        let config = EngineConfig::default();
        assert_eq!(config.store_version().name(), "kjfc-cache-kjfc-v1.0.1");
        assert_eq!(config.notifications.title, "KJFC Dashboard");
        assert_eq!(config.notifications.tag, "kjfc-notification");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_manifest_resolves_against_origin() {
        let config = EngineConfig {
            origin: "https://kjfc.example/some/page?x=1".into(),
            ..Default::default()
        };
        let manifest: Vec<String> = config
            .precache_manifest()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            manifest,
            vec![
                "https://kjfc.example/",
                "https://kjfc.example/index.html",
                "https://kjfc.example/manifest.json",
            ]
        );
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"cache_version": "kjfc-v2", "notifications": {"title": "Club"}}"#)
                .unwrap();
        assert_eq!(config.cache_version, "kjfc-v2");
        assert_eq!(config.cache_prefix, "kjfc-cache");
        assert_eq!(config.notifications.title, "Club");
        assert_eq!(config.notifications.icon, "/icons/icon-192.png");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty_version = EngineConfig {
            cache_version: String::new(),
            ..Default::default()
        };
        assert!(matches!(empty_version.validate(), Err(EngineError::Config(_))));

        let ftp = EngineConfig {
            origin: "ftp://kjfc.example".into(),
            ..Default::default()
        };
        assert!(matches!(ftp.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_unstorable_names() {
        let names = [("kjfc/cache", "v1"), ("kjfc-cache", "v 1"), ("kjfc-cache", "v1é")];
        for (prefix, version) in names {
            let config = EngineConfig {
                cache_prefix: prefix.into(),
                cache_version: version.into(),
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(EngineError::Config(_))),
                "{prefix}-{version} should be rejected"
            );
        }

        let dotted = EngineConfig {
            cache_version: "kjfc-v1.0.1_rc".into(),
            ..Default::default()
        };
        assert!(dotted.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swcache.json");
        std::fs::write(&path, r#"{"origin": "https://kjfc.example", "bypass_hosts": []}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.origin, "https://kjfc.example");
        assert!(config.bypass_hosts.is_empty());

        assert!(EngineConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
