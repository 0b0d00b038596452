//! Token routing: the table that maps inbound bearer tokens to upstream
//! backends, and the cache that keeps it fresh from the control plane.

pub mod cache;
pub mod control_plane;

use std::collections::HashMap;
use std::sync::Arc;

pub use cache::RoutingCache;
pub use control_plane::{ControlPlaneClient, ControlPlaneRoute, Credential};

/// One authorized inbound credential and where its traffic goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub inbound_token: String,
    pub upstream_base_url: String,
    pub upstream_credential: String,
    pub model_name: Option<String>,
}

impl RouteEntry {
    /// Build an entry from a control-plane record, or `None` when either the
    /// token or its upstream model is disabled.
    pub fn from_record(record: &ControlPlaneRoute) -> Option<Self> {
        if !record.is_enabled() {
            return None;
        }

        Some(Self {
            inbound_token: record.token.clone(),
            upstream_base_url: record.upstream_url.clone(),
            upstream_credential: record.upstream_key.clone(),
            model_name: record.model_name.clone(),
        })
    }

    /// Value placed in the outbound `Authorization` header.
    pub fn outbound_authorization(&self) -> String {
        format!("Bearer {}", self.upstream_credential)
    }
}

/// Immutable snapshot of all enabled routes, replaced wholesale on refresh.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: HashMap<String, Arc<RouteEntry>>,
    generation: u64,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(records: &[ControlPlaneRoute], generation: u64) -> Self {
        let entries = records
            .iter()
            .filter_map(RouteEntry::from_record)
            .filter(|entry| !entry.inbound_token.is_empty())
            .map(|entry| (entry.inbound_token.clone(), Arc::new(entry)))
            .collect();

        Self { entries, generation }
    }

    pub fn get(&self, token: &str) -> Option<Arc<RouteEntry>> {
        self.entries.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of successful refreshes that produced this table (0 = never).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RouteEntry>> {
        self.entries.values()
    }
}

/// Extract the token from `Bearer <token>` or a bare token.
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let header = header.trim();
    if header.is_empty() {
        return None;
    }

    let token = match header.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => header,
    };

    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(token: &str, token_status: i64, model_status: i64) -> ControlPlaneRoute {
        ControlPlaneRoute {
            token: token.to_string(),
            token_status,
            upstream_url: "https://m1".to_string(),
            upstream_key: "k1".to_string(),
            model_status,
            token_id: None,
            model_id: None,
            model_name: Some("gpt".to_string()),
        }
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(extract_bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer_token("bearer   abc  "), Some("abc"));
        assert_eq!(extract_bearer_token("BEARER abc"), Some("abc"));
        assert_eq!(extract_bearer_token("sk-bare"), Some("sk-bare"));
        assert_eq!(extract_bearer_token(""), None);
        assert_eq!(extract_bearer_token("   "), None);
        assert_eq!(extract_bearer_token("Basic dXNlcg=="), Some("Basic dXNlcg=="));
    }

    #[test]
    fn test_table_excludes_disabled_entries() {
        let records = vec![
            record("on", 1, 1),
            record("token-off", 0, 1),
            record("model-off", 1, 0),
            record("", 1, 1),
        ];
        let table = RoutingTable::from_records(&records, 1);

        assert_eq!(table.len(), 1);
        let entry = table.get("on").unwrap();
        assert_eq!(entry.upstream_base_url, "https://m1");
        assert_eq!(entry.outbound_authorization(), "Bearer k1");
        assert!(table.get("token-off").is_none());
        assert!(table.get("model-off").is_none());
        assert_eq!(table.generation(), 1);
    }

    #[test]
    fn test_duplicate_tokens_last_record_wins() {
        let mut second = record("dup", 1, 1);
        second.upstream_url = "https://m2".to_string();
        let table = RoutingTable::from_records(&[record("dup", 1, 1), second], 3);

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("dup").unwrap().upstream_base_url, "https://m2");
    }
}
