//! Message bus boundary.
//!
//! The daemon gossips status *transitions* to the rest of the monitor cohort
//! as `StatusProposal` messages and consumes the consensus layer's official
//! verdicts back into the local official caches. The voting itself happens
//! elsewhere; this module only speaks the wire contract.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CheckType, NatsConfig};
use crate::error::StartupError;
use crate::results::{CheckResult, DataMap, DomainKey, EndpointKey, ResultsStore, SiteKey};

/// Subject carrying local status-transition proposals to the voters.
pub const PROPOSE_SUBJECT: &str = "ibp.monitor.checks.propose";
/// Subject carrying agreed official statuses back to every monitor.
pub const OFFICIAL_SUBJECT: &str = "ibp.monitor.checks.official";
/// Subject where monitors announce themselves at startup.
pub const NODES_SUBJECT: &str = "ibp.monitor.nodes";

/// A local status transition offered to the consensus layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusProposal {
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub check_type: CheckType,
    pub check_name: String,
    pub member_name: String,
    pub domain: String,
    pub endpoint: String,
    pub status: bool,
    pub error_text: String,
    pub data: Option<DataMap>,
    #[serde(rename = "IsIPv6")]
    pub is_ipv6: bool,
}

/// An agreed status published by the consensus layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OfficialStatusUpdate {
    pub check_type: CheckType,
    pub check_name: String,
    pub member_name: String,
    pub domain: String,
    pub endpoint: String,
    pub status: bool,
    pub error_text: String,
    pub data: Option<DataMap>,
    #[serde(rename = "IsIPv6")]
    pub is_ipv6: bool,
    pub checktime: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct NodeAnnouncement<'a> {
    #[serde(rename = "NodeID")]
    node_id: &'a str,
    node_role: &'static str,
}

/// Seam between the result sink and the wire client, so the change detector
/// can be exercised without a running NATS server.
#[async_trait]
pub trait StatusBus: Send + Sync {
    async fn propose_check_status(&self, proposal: StatusProposal) -> anyhow::Result<()>;
}

pub struct NatsBus {
    client: async_nats::Client,
    node_id: String,
}

impl NatsBus {
    pub async fn connect(config: &NatsConfig) -> Result<Self, StartupError> {
        let client = async_nats::connect(config.url.as_str()).await?;
        info!(url = %config.url, node_id = %config.node_id, "Connected to NATS");
        Ok(Self { client, node_id: config.node_id.clone() })
    }

    /// Announce this node as a monitor so the consensus layer counts it.
    pub async fn enable_monitor_role(&self) -> Result<(), StartupError> {
        let announcement = NodeAnnouncement { node_id: &self.node_id, node_role: "IBPMonitor" };
        let payload = serde_json::to_vec(&announcement)
            .map_err(|error| StartupError::RoleEnable(error.to_string()))?;
        self.client
            .publish(NODES_SUBJECT, payload.into())
            .await
            .map_err(|error| StartupError::RoleEnable(error.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|error| StartupError::RoleEnable(error.to_string()))?;
        Ok(())
    }

    /// Feed official verdicts from the consensus layer into the store until
    /// the subscription ends or shutdown is requested.
    pub fn spawn_official_listener(
        &self,
        store: Arc<ResultsStore>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut subscription = match client.subscribe(OFFICIAL_SUBJECT).await {
                Ok(subscription) => subscription,
                Err(error) => {
                    warn!(%error, "Failed to subscribe to official status updates");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    message = subscription.next() => {
                        let Some(message) = message else { return };
                        match serde_json::from_slice::<OfficialStatusUpdate>(&message.payload) {
                            Ok(update) => apply_official_update(&store, update).await,
                            Err(error) => {
                                debug!(%error, "Discarding malformed official status update");
                            }
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl StatusBus for NatsBus {
    async fn propose_check_status(&self, proposal: StatusProposal) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&proposal)?;
        self.client.publish(PROPOSE_SUBJECT, payload.into()).await?;
        Ok(())
    }
}

async fn apply_official_update(store: &ResultsStore, update: OfficialStatusUpdate) {
    let result = CheckResult {
        member_name: update.member_name.clone(),
        status: update.status,
        checktime: update.checktime,
        error_text: update.error_text,
        data: update.data,
        is_ipv6: update.is_ipv6,
    };
    match update.check_type {
        CheckType::Site => {
            let key = SiteKey {
                check: update.check_name,
                member: update.member_name,
                ipv6: update.is_ipv6,
            };
            store.set_official_site(key, result).await;
        }
        CheckType::Domain => {
            let key = DomainKey {
                check: update.check_name,
                member: update.member_name,
                domain: update.domain,
                ipv6: update.is_ipv6,
            };
            store.set_official_domain(key, result).await;
        }
        CheckType::Endpoint => {
            let key = EndpointKey {
                check: update.check_name,
                member: update.member_name,
                domain: update.domain,
                endpoint: update.endpoint,
                ipv6: update.is_ipv6,
            };
            store.set_official_endpoint(key, result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn proposal_wire_format_uses_pascal_case() {
        let proposal = StatusProposal {
            node_id: "monitor-eu1".to_string(),
            check_type: CheckType::Endpoint,
            check_name: "wss".to_string(),
            member_name: "provider-one".to_string(),
            domain: "rpc.example.com".to_string(),
            endpoint: "wss://rpc.example.com/polkadot".to_string(),
            status: false,
            error_text: "Wrong network".to_string(),
            data: None,
            is_ipv6: true,
        };

        let encoded = serde_json::to_value(&proposal).unwrap();
        assert_eq!(encoded["NodeID"], json!("monitor-eu1"));
        assert_eq!(encoded["CheckType"], json!("endpoint"));
        assert_eq!(encoded["MemberName"], json!("provider-one"));
        assert_eq!(encoded["IsIPv6"], json!(true));

        let decoded: StatusProposal = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, proposal);
    }

    #[tokio::test]
    async fn official_updates_land_in_the_matching_cache() {
        let store = ResultsStore::new();
        let update = OfficialStatusUpdate {
            check_type: CheckType::Domain,
            check_name: "ssl".to_string(),
            member_name: "provider-one".to_string(),
            domain: "rpc.example.com".to_string(),
            endpoint: String::new(),
            status: false,
            error_text: "Less than 5 days to expiry".to_string(),
            data: None,
            is_ipv6: false,
            checktime: Utc::now(),
        };

        apply_official_update(&store, update).await;

        let key = DomainKey {
            check: "ssl".to_string(),
            member: "provider-one".to_string(),
            domain: "rpc.example.com".to_string(),
            ipv6: false,
        };
        assert_eq!(store.official_domain_status(&key).await, Some(false));

        let site_key = SiteKey {
            check: "ssl".to_string(),
            member: "provider-one".to_string(),
            ipv6: false,
        };
        assert_eq!(store.official_site_status(&site_key).await, None);
    }
}
