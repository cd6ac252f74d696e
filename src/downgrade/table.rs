//! The downgrade table.

use std::str::FromStr;
use std::sync::Arc;

use axum::http::uri::Authority;
use dashmap::DashSet;
use url::Url;

use crate::observability::metrics;

/// Set of `hostname + path` keys known to be served over HTTPS.
///
/// Cloning yields another handle onto the same table.
#[derive(Debug, Clone, Default)]
pub struct DowngradeTable {
    entries: Arc<DashSet<String>>,
}

impl DowngradeTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a request for `host` and `raw_path` must go upstream over TLS.
    ///
    /// `host` may carry a port; `raw_path` may carry a query string.
    pub fn should_use_secure_scheme(&self, host: &str, raw_path: &str) -> bool {
        self.entries.contains(&downgrade_key(host, raw_path))
    }

    /// Remember that the resource behind `link` is served over HTTPS.
    ///
    /// Returns `true` when the key was not present before. Links that do not
    /// parse as absolute URLs with a host are ignored.
    pub fn record_secure_link(&self, link: &str) -> bool {
        let url = match Url::parse(link) {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!(link = %link, error = %e, "Ignoring unparsable secure link");
                return false;
            }
        };
        let Some(host) = url.host_str() else {
            tracing::debug!(link = %link, "Ignoring secure link without host");
            return false;
        };

        let key = format!("{}{}", host.to_ascii_lowercase(), url.path());
        if self.entries.contains(&key) {
            return false;
        }
        let inserted = self.entries.insert(key.clone());
        if inserted {
            tracing::info!(key = %key, "Add downgrade entry");
            metrics::record_downgrade_entry();
        }
        inserted
    }

    /// Number of recorded keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the table key for a host (optionally with port) and a request path.
pub fn downgrade_key(host: &str, raw_path: &str) -> String {
    let host = Authority::from_str(host)
        .map(|authority| authority.host().to_ascii_lowercase())
        .unwrap_or_else(|_| host.to_ascii_lowercase());

    let path = raw_path
        .split(['?', '#'])
        .next()
        .filter(|path| !path.is_empty())
        .unwrap_or("/");

    format!("{}{}", host, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_table_is_plaintext() {
        let table = DowngradeTable::new();
        assert!(table.is_empty());
        assert!(!table.should_use_secure_scheme("example.com", "/"));
    }

    #[test]
    fn test_recording_is_idempotent() {
        let table = DowngradeTable::new();
        assert!(table.record_secure_link("https://example.com/login"));
        assert!(!table.record_secure_link("https://example.com/login"));
        assert_eq!(table.len(), 1);
        assert!(table.should_use_secure_scheme("example.com", "/login"));
    }

    #[test]
    fn test_scheme_port_and_query_are_normalized_away() {
        let table = DowngradeTable::new();
        table.record_secure_link("https://Example.com:8443/account?next=%2Fhome#top");

        assert!(table.should_use_secure_scheme("example.com", "/account"));
        assert!(table.should_use_secure_scheme("example.com:80", "/account?session=1"));
        assert!(table.should_use_secure_scheme("EXAMPLE.COM", "/account"));

        // The same key regardless of which variant was recorded.
        assert!(!table.record_secure_link("http://example.com/account"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_paths_are_independent() {
        let table = DowngradeTable::new();
        table.record_secure_link("https://a.com/x");

        assert!(table.should_use_secure_scheme("a.com", "/x"));
        assert!(!table.should_use_secure_scheme("a.com", "/y"));
        assert!(!table.should_use_secure_scheme("b.com", "/x"));
    }

    #[test]
    fn test_bare_host_maps_to_root() {
        let table = DowngradeTable::new();
        table.record_secure_link("https://a.com");
        assert!(table.should_use_secure_scheme("a.com", "/"));
        assert!(table.should_use_secure_scheme("a.com", ""));
    }

    #[test]
    fn test_unparsable_links_are_ignored() {
        let table = DowngradeTable::new();
        assert!(!table.record_secure_link("/relative/path"));
        assert!(!table.record_secure_link("https://"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let table = DowngradeTable::new();
        let handle = table.clone();
        handle.record_secure_link("https://a.com/shared");
        assert!(table.should_use_secure_scheme("a.com", "/shared"));
    }

    #[test]
    fn test_downgrade_key() {
        assert_eq!(downgrade_key("Site.com:8080", "/login?x=1"), "site.com/login");
        assert_eq!(downgrade_key("[::1]:8080", "/a"), "[::1]/a");
    }
}
