//! Local result sink and change detector.
//!
//! Every probe run ends here: the fresh result is written to the local
//! store, then compared against the official status for the same key. Only
//! transitions (or keys with no official status yet) are proposed onto the
//! bus, so the cohort gossips changes rather than heartbeats.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::bus::{StatusBus, StatusProposal};
use crate::config::{Check, CheckType, Member};
use crate::monitoring::util::parse_url_for_domain;
use crate::results::{CheckResult, DataMap, DomainKey, EndpointKey, ResultsStore, SiteKey};

pub struct ResultSink {
    store: Arc<ResultsStore>,
    bus: Arc<dyn StatusBus>,
    node_id: String,
}

impl ResultSink {
    pub fn new(store: Arc<ResultsStore>, bus: Arc<dyn StatusBus>, node_id: impl Into<String>) -> Self {
        Self { store, bus, node_id: node_id.into() }
    }

    pub async fn update_site_result_local(
        &self,
        check: &Check,
        member: &Member,
        status: bool,
        error_text: &str,
        data: Option<DataMap>,
        is_ipv6: bool,
    ) {
        let key = SiteKey {
            check: check.name.clone(),
            member: member.details.name.clone(),
            ipv6: is_ipv6,
        };
        let result = self.make_result(member, status, error_text, data.clone(), is_ipv6);
        self.store.update_local_site(key.clone(), result).await;

        let official = self.store.official_site_status(&key).await;
        self.propose_if_changed(
            official,
            CheckType::Site,
            &check.name,
            &member.details.name,
            "",
            "",
            status,
            error_text,
            data,
            is_ipv6,
        )
        .await;
    }

    pub async fn update_domain_result_local(
        &self,
        check: &Check,
        domain: &str,
        member: &Member,
        status: bool,
        error_text: &str,
        data: Option<DataMap>,
        is_ipv6: bool,
    ) {
        let key = DomainKey {
            check: check.name.clone(),
            member: member.details.name.clone(),
            domain: domain.to_string(),
            ipv6: is_ipv6,
        };
        let result = self.make_result(member, status, error_text, data.clone(), is_ipv6);
        self.store.update_local_domain(key.clone(), result).await;

        let official = self.store.official_domain_status(&key).await;
        self.propose_if_changed(
            official,
            CheckType::Domain,
            &check.name,
            &member.details.name,
            domain,
            "",
            status,
            error_text,
            data,
            is_ipv6,
        )
        .await;
    }

    pub async fn update_endpoint_result_local(
        &self,
        check: &Check,
        endpoint: &str,
        member: &Member,
        status: bool,
        error_text: &str,
        data: Option<DataMap>,
        is_ipv6: bool,
    ) {
        let domain = parse_url_for_domain(endpoint);
        let key = EndpointKey {
            check: check.name.clone(),
            member: member.details.name.clone(),
            domain: domain.clone(),
            endpoint: endpoint.to_string(),
            ipv6: is_ipv6,
        };
        let result = self.make_result(member, status, error_text, data.clone(), is_ipv6);
        self.store.update_local_endpoint(key.clone(), result).await;

        let official = self.store.official_endpoint_status(&key).await;
        self.propose_if_changed(
            official,
            CheckType::Endpoint,
            &check.name,
            &member.details.name,
            &domain,
            endpoint,
            status,
            error_text,
            data,
            is_ipv6,
        )
        .await;
    }

    fn make_result(
        &self,
        member: &Member,
        status: bool,
        error_text: &str,
        data: Option<DataMap>,
        is_ipv6: bool,
    ) -> CheckResult {
        CheckResult {
            member_name: member.details.name.clone(),
            status,
            checktime: Utc::now(),
            error_text: error_text.to_string(),
            data,
            is_ipv6,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn propose_if_changed(
        &self,
        official: Option<bool>,
        check_type: CheckType,
        check_name: &str,
        member_name: &str,
        domain: &str,
        endpoint: &str,
        status: bool,
        error_text: &str,
        data: Option<DataMap>,
        is_ipv6: bool,
    ) {
        if official == Some(status) {
            return;
        }
        let proposal = StatusProposal {
            node_id: self.node_id.clone(),
            check_type,
            check_name: check_name.to_string(),
            member_name: member_name.to_string(),
            domain: domain.to_string(),
            endpoint: endpoint.to_string(),
            status,
            error_text: error_text.to_string(),
            data,
            is_ipv6,
        };
        if let Err(error) = self.bus.propose_check_status(proposal).await {
            warn!(%error, check = check_name, member = member_name, "Failed to publish status proposal");
        }
    }
}
