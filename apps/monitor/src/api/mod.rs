//! Read-only results API.
//!
//! `GET /results` serves a snapshot of the official caches for operators
//! and the DNS layer: per result grouping only the newest entry per member
//! is kept (the caches already guarantee that), and only members whose
//! newest result is offline are included.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::results::{CheckResult, DataMap, ResultsStore};

#[derive(Debug, Serialize)]
struct ResultEntry {
    #[serde(rename = "MemberName")]
    member_name: String,
    #[serde(rename = "ErrorText")]
    error_text: String,
    #[serde(rename = "Data")]
    data: Option<DataMap>,
    #[serde(rename = "IsIPv6")]
    is_ipv6: bool,
    #[serde(rename = "Checktime")]
    checktime: DateTime<Utc>,
}

impl From<CheckResult> for ResultEntry {
    fn from(result: CheckResult) -> Self {
        Self {
            member_name: result.member_name,
            error_text: result.error_text,
            data: result.data,
            is_ipv6: result.is_ipv6,
            checktime: result.checktime,
        }
    }
}

#[derive(Debug, Serialize)]
struct SiteGroup {
    #[serde(rename = "CheckName")]
    check_name: String,
    #[serde(rename = "IsIPv6")]
    is_ipv6: bool,
    #[serde(rename = "Results")]
    results: Vec<ResultEntry>,
}

#[derive(Debug, Serialize)]
struct DomainGroup {
    #[serde(rename = "CheckName")]
    check_name: String,
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "IsIPv6")]
    is_ipv6: bool,
    #[serde(rename = "Results")]
    results: Vec<ResultEntry>,
}

#[derive(Debug, Serialize)]
struct EndpointGroup {
    #[serde(rename = "CheckName")]
    check_name: String,
    #[serde(rename = "Domain")]
    domain: String,
    #[serde(rename = "RpcUrl")]
    rpc_url: String,
    #[serde(rename = "IsIPv6")]
    is_ipv6: bool,
    #[serde(rename = "Results")]
    results: Vec<ResultEntry>,
}

#[derive(Debug, Serialize)]
struct ResultsResponse {
    #[serde(rename = "SiteResults")]
    site_results: Vec<SiteGroup>,
    #[serde(rename = "DomainResults")]
    domain_results: Vec<DomainGroup>,
    #[serde(rename = "EndpointResults")]
    endpoint_results: Vec<EndpointGroup>,
}

pub fn router(store: Arc<ResultsStore>) -> Router {
    Router::new().route("/results", get(results)).with_state(store)
}

/// Bind and serve the API until shutdown is requested.
pub async fn serve(
    store: Arc<ResultsStore>,
    listen_address: &str,
    listen_port: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let bind_addr = format!("{listen_address}:{listen_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, "Starting monitor results API");
    axum::serve(listener, router(store))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn results(State(store): State<Arc<ResultsStore>>) -> Json<ResultsResponse> {
    Json(build_response(&store).await)
}

async fn build_response(store: &ResultsStore) -> ResultsResponse {
    let mut site_groups: HashMap<(String, bool), Vec<ResultEntry>> = HashMap::new();
    for (key, result) in store.official_site_snapshot().await {
        if result.status {
            continue;
        }
        site_groups.entry((key.check, key.ipv6)).or_default().push(result.into());
    }

    let mut domain_groups: HashMap<(String, String, bool), Vec<ResultEntry>> = HashMap::new();
    for (key, result) in store.official_domain_snapshot().await {
        if result.status {
            continue;
        }
        domain_groups.entry((key.check, key.domain, key.ipv6)).or_default().push(result.into());
    }

    let mut endpoint_groups: HashMap<(String, String, String, bool), Vec<ResultEntry>> =
        HashMap::new();
    for (key, result) in store.official_endpoint_snapshot().await {
        if result.status {
            continue;
        }
        endpoint_groups
            .entry((key.check, key.domain, key.endpoint, key.ipv6))
            .or_default()
            .push(result.into());
    }

    ResultsResponse {
        site_results: site_groups
            .into_iter()
            .map(|((check_name, is_ipv6), results)| SiteGroup { check_name, is_ipv6, results })
            .collect(),
        domain_results: domain_groups
            .into_iter()
            .map(|((check_name, domain, is_ipv6), results)| DomainGroup {
                check_name,
                domain,
                is_ipv6,
                results,
            })
            .collect(),
        endpoint_results: endpoint_groups
            .into_iter()
            .map(|((check_name, domain, rpc_url, is_ipv6), results)| EndpointGroup {
                check_name,
                domain,
                rpc_url,
                is_ipv6,
                results,
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    use crate::results::{DomainKey, SiteKey};

    fn result(member: &str, status: bool, error: &str) -> CheckResult {
        CheckResult {
            member_name: member.to_string(),
            status,
            checktime: Utc::now(),
            error_text: error.to_string(),
            data: None,
            is_ipv6: false,
        }
    }

    async fn seeded_store() -> Arc<ResultsStore> {
        let store = Arc::new(ResultsStore::new());
        store
            .set_official_site(
                SiteKey { check: "ping".into(), member: "down".into(), ipv6: false },
                result("down", false, "PingCheck: avgRtt=900ms, loss=40%"),
            )
            .await;
        store
            .set_official_site(
                SiteKey { check: "ping".into(), member: "up".into(), ipv6: false },
                result("up", true, ""),
            )
            .await;
        store
            .set_official_domain(
                DomainKey {
                    check: "ssl".into(),
                    member: "down".into(),
                    domain: "rpc.example.com".into(),
                    ipv6: false,
                },
                result("down", false, "Less than 5 days to expiry"),
            )
            .await;
        store
    }

    #[tokio::test]
    async fn only_offline_members_are_reported() {
        let store = seeded_store().await;
        let response = build_response(&store).await;

        assert_eq!(response.site_results.len(), 1);
        let group = &response.site_results[0];
        assert_eq!(group.check_name, "ping");
        assert_eq!(group.results.len(), 1);
        assert_eq!(group.results[0].member_name, "down");

        assert_eq!(response.domain_results.len(), 1);
        assert_eq!(response.domain_results[0].domain, "rpc.example.com");
        assert!(response.endpoint_results.is_empty());
    }

    #[tokio::test]
    async fn results_endpoint_serves_pascal_case_json() {
        let store = seeded_store().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(store)).await.unwrap();
        });

        let body: Value = reqwest::get(format!("http://{addr}/results"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let site_results = body["SiteResults"].as_array().unwrap();
        assert_eq!(site_results.len(), 1);
        assert_eq!(site_results[0]["CheckName"], json!("ping"));
        assert_eq!(site_results[0]["IsIPv6"], json!(false));

        let entry = &site_results[0]["Results"][0];
        assert_eq!(entry["MemberName"], json!("down"));
        assert_eq!(entry["ErrorText"], json!("PingCheck: avgRtt=900ms, loss=40%"));
        // RFC3339 checktime
        let checktime = entry["Checktime"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(checktime).is_ok());

        assert_eq!(body["DomainResults"][0]["Domain"], json!("rpc.example.com"));
        assert!(body["EndpointResults"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_store_serves_empty_groupings() {
        let store = Arc::new(ResultsStore::new());
        let response = build_response(&store).await;
        assert!(response.site_results.is_empty());
        assert!(response.domain_results.is_empty());
        assert!(response.endpoint_results.is_empty());
    }
}
