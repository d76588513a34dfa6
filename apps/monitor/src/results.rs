//! Local and official result caches.
//!
//! Probes write their latest local result per (check, member, target,
//! address family) key. The official caches mirror what the consensus layer
//! agreed on; they are fed by the bus listener and read by the change
//! detector and the results API.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Free-form probe data attached to a result (RTTs, expiry days, chain ids).
pub type DataMap = serde_json::Map<String, Value>;

/// One probe outcome for one member and address family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub member_name: String,
    pub status: bool,
    pub checktime: DateTime<Utc>,
    pub error_text: String,
    pub data: Option<DataMap>,
    pub is_ipv6: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SiteKey {
    pub check: String,
    pub member: String,
    pub ipv6: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainKey {
    pub check: String,
    pub member: String,
    pub domain: String,
    pub ipv6: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub check: String,
    pub member: String,
    pub domain: String,
    pub endpoint: String,
    pub ipv6: bool,
}

/// Latest-result maps. Inserting for an existing key replaces the previous
/// entry, so each map naturally holds the newest result per key.
#[derive(Default)]
pub struct ResultsStore {
    local_site: RwLock<HashMap<SiteKey, CheckResult>>,
    local_domain: RwLock<HashMap<DomainKey, CheckResult>>,
    local_endpoint: RwLock<HashMap<EndpointKey, CheckResult>>,
    official_site: RwLock<HashMap<SiteKey, CheckResult>>,
    official_domain: RwLock<HashMap<DomainKey, CheckResult>>,
    official_endpoint: RwLock<HashMap<EndpointKey, CheckResult>>,
}

impl ResultsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn update_local_site(&self, key: SiteKey, result: CheckResult) {
        self.local_site.write().await.insert(key, result);
    }

    pub async fn update_local_domain(&self, key: DomainKey, result: CheckResult) {
        self.local_domain.write().await.insert(key, result);
    }

    pub async fn update_local_endpoint(&self, key: EndpointKey, result: CheckResult) {
        self.local_endpoint.write().await.insert(key, result);
    }

    pub async fn local_site(&self, key: &SiteKey) -> Option<CheckResult> {
        self.local_site.read().await.get(key).cloned()
    }

    pub async fn local_domain(&self, key: &DomainKey) -> Option<CheckResult> {
        self.local_domain.read().await.get(key).cloned()
    }

    pub async fn local_endpoint(&self, key: &EndpointKey) -> Option<CheckResult> {
        self.local_endpoint.read().await.get(key).cloned()
    }

    pub async fn set_official_site(&self, key: SiteKey, result: CheckResult) {
        self.official_site.write().await.insert(key, result);
    }

    pub async fn set_official_domain(&self, key: DomainKey, result: CheckResult) {
        self.official_domain.write().await.insert(key, result);
    }

    pub async fn set_official_endpoint(&self, key: EndpointKey, result: CheckResult) {
        self.official_endpoint.write().await.insert(key, result);
    }

    pub async fn official_site_status(&self, key: &SiteKey) -> Option<bool> {
        self.official_site.read().await.get(key).map(|result| result.status)
    }

    pub async fn official_domain_status(&self, key: &DomainKey) -> Option<bool> {
        self.official_domain.read().await.get(key).map(|result| result.status)
    }

    pub async fn official_endpoint_status(&self, key: &EndpointKey) -> Option<bool> {
        self.official_endpoint.read().await.get(key).map(|result| result.status)
    }

    pub async fn official_site_snapshot(&self) -> Vec<(SiteKey, CheckResult)> {
        self.official_site.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub async fn official_domain_snapshot(&self) -> Vec<(DomainKey, CheckResult)> {
        self.official_domain.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub async fn official_endpoint_snapshot(&self) -> Vec<(EndpointKey, CheckResult)> {
        self.official_endpoint.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}
