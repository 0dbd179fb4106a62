use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;

use crate::{Proxy, ProxyBuilder};

/// Top-level proxy configuration. Format-agnostic (TOML via serde).
#[derive(Debug, Default, Deserialize)]
pub struct ProxyConfig {
    /// Listen address, e.g. "127.0.0.1:8080".
    pub listen: Option<String>,

    /// Origin base URI all inbound request paths are appended to.
    pub target: Option<String>,

    /// Headers merged into every origin request; an entry replaces the
    /// derived header of the same name.
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
}

impl ProxyConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        toml::from_str(&raw).context("parsing config")
    }

    /// Convert into a builder. Fails on a missing target or an invalid
    /// header entry, so a bad config never produces a half-built proxy.
    pub fn into_builder(self) -> anyhow::Result<ProxyBuilder> {
        let target = self.target.context("config has no target")?;
        let mut builder = Proxy::builder().target(&target)?;
        if !self.headers.is_empty() {
            builder = builder.override_headers(self.headers)?;
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: ProxyConfig = toml::from_str(
            r#"
            listen = "127.0.0.1:9000"
            target = "http://origin.internal:8080"

            [headers]
            x-api-key = ["sekret"]
            via = ["proxy-1", "proxy-2"]
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(config.target.as_deref(), Some("http://origin.internal:8080"));
        assert_eq!(config.headers["via"], ["proxy-1", "proxy-2"]);
        config.into_builder().unwrap().build().unwrap();
    }

    #[test]
    fn missing_target_is_an_error() {
        let config: ProxyConfig = toml::from_str(r#"listen = "127.0.0.1:9000""#).unwrap();
        assert!(config.into_builder().is_err());
    }

    #[test]
    fn invalid_header_name_is_an_error() {
        let config: ProxyConfig = toml::from_str(
            r#"
            target = "http://origin"

            [headers]
            "bad header" = ["v"]
            "#,
        )
        .unwrap();
        assert!(config.into_builder().is_err());
    }

    #[test]
    fn trailing_slash_trimmed_from_target() {
        let config: ProxyConfig = toml::from_str(r#"target = "http://origin/""#).unwrap();
        config.into_builder().unwrap().build().unwrap();
    }

    #[test]
    fn schemeless_target_rejected() {
        let config: ProxyConfig = toml::from_str(r#"target = "origin:8080""#).unwrap();
        assert!(config.into_builder().is_err());
    }
}
