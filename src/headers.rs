use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION};

/// How caller-supplied headers are folded into the derived origin set.
///
/// Exactly one policy may be configured per proxy instance.
#[derive(Clone)]
pub enum HeaderPolicy {
    /// Fixed entries merged in after derivation. An entry replaces the
    /// whole value list of a same-named derived header.
    Override(Vec<(HeaderName, Vec<HeaderValue>)>),
    /// Replaces the derived map wholesale.
    Transform(Arc<dyn Fn(HeaderMap) -> HeaderMap + Send + Sync>),
}

impl HeaderPolicy {
    /// Build an override policy from string pairs, validating names and
    /// values up front so a bad entry never reaches a live request.
    pub fn overrides<N, V>(pairs: impl IntoIterator<Item = (N, Vec<V>)>) -> anyhow::Result<Self>
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let mut entries = Vec::new();
        for (name, values) in pairs {
            let name: HeaderName = name
                .as_ref()
                .parse()
                .with_context(|| format!("invalid header name {:?}", name.as_ref()))?;
            let values = values
                .iter()
                .map(|v| {
                    HeaderValue::from_str(v.as_ref())
                        .with_context(|| format!("invalid value for header {name}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            entries.push((name, values));
        }
        Ok(Self::Override(entries))
    }

    pub fn transform(f: impl Fn(HeaderMap) -> HeaderMap + Send + Sync + 'static) -> Self {
        Self::Transform(Arc::new(f))
    }
}

impl fmt::Debug for HeaderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Override(entries) => f.debug_tuple("Override").field(entries).finish(),
            Self::Transform(_) => f.debug_tuple("Transform").finish(),
        }
    }
}

/// Derive the outbound origin headers from the inbound client headers.
///
/// `accept-encoding` is dropped: the proxy decodes response bodies itself
/// and must not offer encodings it would then have to relay verbatim.
/// `connection` is consumed rather than relayed: an `upgrade` token
/// survives as exactly `connection: upgrade`, while every other token
/// names a hop-by-hop header that is stripped from the outbound set.
/// The configured policy, if any, runs last.
pub fn derive(inbound: &HeaderMap, policy: Option<&HeaderPolicy>) -> HeaderMap {
    let mut upgrade = false;
    let mut hop_by_hop: HashSet<HeaderName> = HashSet::new();
    for value in inbound.get_all(CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',') {
            let token = token.trim().to_ascii_lowercase();
            if token == "upgrade" {
                upgrade = true;
            } else if let Ok(name) = token.parse::<HeaderName>() {
                hop_by_hop.insert(name);
            }
        }
    }

    let mut out = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound.iter() {
        if name == ACCEPT_ENCODING || name == CONNECTION || hop_by_hop.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if upgrade {
        out.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    }

    match policy {
        Some(HeaderPolicy::Override(entries)) => {
            for (name, values) in entries {
                out.remove(name);
                for value in values {
                    out.append(name.clone(), value.clone());
                }
            }
        }
        Some(HeaderPolicy::Transform(f)) => out = f(out),
        None => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(entries: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in entries {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn values(map: &HeaderMap, name: &str) -> Vec<String> {
        map.get_all(name)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn accept_encoding_never_forwarded() {
        let out = derive(&inbound(&[("accept-encoding", "gzip"), ("host", "a")]), None);
        assert!(out.get(ACCEPT_ENCODING).is_none());
        assert_eq!(values(&out, "host"), ["a"]);
    }

    #[test]
    fn upgrade_token_forces_single_connection_value() {
        let out = derive(
            &inbound(&[("connection", "keep-alive, Upgrade"), ("upgrade", "websocket")]),
            None,
        );
        assert_eq!(values(&out, "connection"), ["upgrade"]);
        assert_eq!(values(&out, "upgrade"), ["websocket"]);
    }

    #[test]
    fn connection_tokens_strip_named_headers() {
        let out = derive(
            &inbound(&[
                ("connection", "x-hop, keep-alive"),
                ("x-hop", "secret"),
                ("keep-alive", "timeout=5"),
                ("x-kept", "stays"),
            ]),
            None,
        );
        assert!(out.get("connection").is_none());
        assert!(out.get("x-hop").is_none());
        assert!(out.get("keep-alive").is_none());
        assert_eq!(values(&out, "x-kept"), ["stays"]);
    }

    #[test]
    fn connection_without_upgrade_is_dropped_entirely() {
        let out = derive(&inbound(&[("connection", "keep-alive"), ("host", "a")]), None);
        assert!(out.get("connection").is_none());
    }

    #[test]
    fn tokens_fold_case() {
        let out = derive(
            &inbound(&[("connection", "KEEP-ALIVE"), ("keep-alive", "timeout=5")]),
            None,
        );
        assert!(out.get("keep-alive").is_none());
    }

    #[test]
    fn multi_value_order_preserved() {
        let out = derive(
            &inbound(&[("x-many", "first"), ("x-many", "second"), ("x-many", "third")]),
            None,
        );
        assert_eq!(values(&out, "x-many"), ["first", "second", "third"]);
    }

    #[test]
    fn override_replaces_whole_value_list() {
        let policy = HeaderPolicy::overrides([("x-many", vec!["only"])]).unwrap();
        let out = derive(
            &inbound(&[("x-many", "first"), ("x-many", "second")]),
            Some(&policy),
        );
        assert_eq!(values(&out, "x-many"), ["only"]);
    }

    #[test]
    fn override_adds_missing_headers() {
        let policy = HeaderPolicy::overrides([("x-api-key", vec!["sekret"])]).unwrap();
        let out = derive(&inbound(&[("host", "a")]), Some(&policy));
        assert_eq!(values(&out, "x-api-key"), ["sekret"]);
        assert_eq!(values(&out, "host"), ["a"]);
    }

    #[test]
    fn transform_replaces_map_wholesale() {
        let policy = HeaderPolicy::transform(|_derived| {
            let mut map = HeaderMap::new();
            map.insert("x-only", HeaderValue::from_static("me"));
            map
        });
        let out = derive(&inbound(&[("host", "a"), ("x-other", "b")]), Some(&policy));
        assert_eq!(out.len(), 1);
        assert_eq!(values(&out, "x-only"), ["me"]);
    }

    #[test]
    fn invalid_override_name_rejected() {
        assert!(HeaderPolicy::overrides([("bad header", vec!["v"])]).is_err());
    }

    #[test]
    fn invalid_override_value_rejected() {
        assert!(HeaderPolicy::overrides([("x-ok", vec!["bad\nvalue"])]).is_err());
    }
}
