//! Endpoint-level Ethereum JSON-RPC probe. WebSocket endpoint URLs are
//! rewritten to their HTTP form, the HTTP client resolves the hostname to
//! the member's IP (the URL itself is never rewritten), and the node is
//! interrogated with four calls: chainId, block number, net_version and
//! syncing state.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::{Check, Member, Service};
use crate::monitoring::registry::EndpointProbe;
use crate::monitoring::sink::ResultSink;
use crate::monitoring::util::{ParsedUrl, int_option, parse_endpoint_url};
use crate::results::DataMap;

#[derive(Debug, Deserialize)]
struct EthRpcResponse {
    result: Option<Value>,
    error: Option<EthRpcError>,
}

#[derive(Debug, Deserialize)]
struct EthRpcError {
    code: i64,
    message: String,
}

#[derive(Default)]
pub struct EthRpcProbe;

impl EthRpcProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EndpointProbe for EthRpcProbe {
    async fn run(
        &self,
        sink: &ResultSink,
        check: &Check,
        endpoint: &str,
        service: &Service,
        member: &Member,
    ) {
        let has_v4 = !member.service.service_ipv4.is_empty();
        let has_v6 = !member.service.service_ipv6.is_empty();
        if !has_v4 && !has_v6 {
            sink.update_endpoint_result_local(
                check, endpoint, member, false, "No IPv4 or IPv6 configured", None, false,
            )
            .await;
            return;
        }
        if has_v4 {
            check_single(sink, check, endpoint, service, member, false).await;
        }
        if has_v6 {
            check_single(sink, check, endpoint, service, member, true).await;
        }
    }
}

async fn check_single(
    sink: &ResultSink,
    check: &Check,
    endpoint: &str,
    service: &Service,
    member: &Member,
    is_ipv6: bool,
) {
    match run_protocol(check, endpoint, service, member.ip(is_ipv6)).await {
        Ok(data) => {
            sink.update_endpoint_result_local(check, endpoint, member, true, "", Some(data), is_ipv6)
                .await;
            debug!(member = %member.details.name, endpoint, is_ipv6, success = true, "ETHRPC check completed");
        }
        Err(reason) => {
            sink.update_endpoint_result_local(check, endpoint, member, false, &reason, None, is_ipv6)
                .await;
            debug!(member = %member.details.name, endpoint, is_ipv6, success = false, "ETHRPC check completed");
        }
    }
}

async fn run_protocol(
    check: &Check,
    endpoint: &str,
    service: &Service,
    ip: &str,
) -> Result<DataMap, String> {
    let parsed =
        parse_endpoint_url(endpoint).ok_or_else(|| format!("Invalid endpoint URL: {endpoint}"))?;
    let address: IpAddr = ip.parse().map_err(|_| format!("Invalid member address: {ip}"))?;
    let url = http_url(&parsed);

    let connect_timeout =
        Duration::from_secs(int_option(&check.extra_options, "ConnectTimeout", 10).max(1) as u64);
    let client = Client::builder()
        .timeout(connect_timeout)
        .connect_timeout(connect_timeout)
        .resolve(&parsed.host, SocketAddr::new(address, 0))
        .build()
        .map_err(|error| format!("HTTP client error: {error}"))?;

    let chain_id = eth_call(&client, &url, "eth_chainId")
        .await
        .map_err(|error| format!("eth_chainId failed: {error}"))?;
    let block_number = eth_call(&client, &url, "eth_blockNumber")
        .await
        .map_err(|error| format!("eth_blockNumber failed: {error}"))?;
    let net_version = eth_call(&client, &url, "net_version")
        .await
        .map_err(|error| format!("net_version failed: {error}"))?;
    let syncing = eth_call(&client, &url, "eth_syncing")
        .await
        .map_err(|error| format!("eth_syncing failed: {error}"))?;

    // Anything but the literal false (including a sync-progress object)
    // means the node is still catching up.
    if syncing != Value::Bool(false) {
        return Err("Node is syncing".to_string());
    }

    let chain_id_text = chain_id.as_str().unwrap_or_default().to_string();
    let block_number_text = block_number.as_str().unwrap_or_default().to_string();
    let net_version_text = net_version.as_str().unwrap_or_default().to_string();
    let chain_id_decimal = chain_id_text
        .strip_prefix("0x")
        .and_then(|hex| i64::from_str_radix(hex, 16).ok())
        .unwrap_or_default();

    // The catalog's network name may be a net_version, a hex chainId or a
    // decimal chainId; accept any of the three forms.
    let expected = service.configuration.network_name.to_lowercase();
    let network_matches = net_version_text.eq_ignore_ascii_case(&expected)
        || chain_id_text.eq_ignore_ascii_case(&expected)
        || chain_id_decimal.to_string() == expected;
    if !network_matches {
        return Err(format!(
            "Wrong network: expected {expected}, got net_version={net_version_text} chainId={chain_id_text} (decimal={chain_id_decimal})"
        ));
    }

    let mut data = DataMap::new();
    data.insert("chainId".to_string(), json!(chain_id_text));
    data.insert("chainIdDec".to_string(), json!(chain_id_decimal));
    data.insert("blockNumber".to_string(), json!(block_number_text));
    data.insert("netVersion".to_string(), json!(net_version_text));
    data.insert("syncing".to_string(), json!(false));
    data.insert("network".to_string(), json!(expected));
    Ok(data)
}

/// wss:// and ws:// endpoints answer Ethereum RPC over HTTPS/HTTP on the
/// same host, port and path.
fn http_url(parsed: &ParsedUrl) -> String {
    let scheme = match parsed.scheme.as_str() {
        "wss" => "https",
        "ws" => "http",
        other => other,
    };
    match parsed.port {
        Some(port) => format!("{scheme}://{}:{port}{}", parsed.host, parsed.path),
        None => format!("{scheme}://{}{}", parsed.host, parsed.path),
    }
}

async fn eth_call(client: &Client, url: &str, method: &str) -> Result<Value, String> {
    let request = json!({ "jsonrpc": "2.0", "method": method, "params": [], "id": 1 });
    let response = client
        .post(url)
        .json(&request)
        .send()
        .await
        .map_err(|error| format!("request failed: {error}"))?;

    let status = response.status();
    let body =
        response.bytes().await.map_err(|error| format!("failed to read response: {error}"))?;
    if !status.is_success() {
        return Err(format!("HTTP error {}", status.as_u16()));
    }

    let decoded: EthRpcResponse = serde_json::from_slice(&body)
        .map_err(|error| format!("failed to decode response: {error}"))?;
    if let Some(error) = decoded.error {
        return Err(format!("RPC error {}: {}", error.code, error.message));
    }
    Ok(decoded.result.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    use crate::bus::{StatusBus, StatusProposal};
    use crate::config::{MemberDetails, ServiceConfiguration};
    use crate::results::{EndpointKey, ResultsStore};

    #[derive(Default)]
    struct RecordingBus {
        proposals: Mutex<Vec<StatusProposal>>,
    }

    #[async_trait]
    impl StatusBus for RecordingBus {
        async fn propose_check_status(&self, proposal: StatusProposal) -> anyhow::Result<()> {
            self.proposals.lock().await.push(proposal);
            Ok(())
        }
    }

    /// A canned Ethereum node: each method maps to a fixed `result` value.
    async fn spawn_rpc_server(responses: HashMap<&'static str, Value>) -> u16 {
        async fn handle(
            State(responses): State<Arc<HashMap<&'static str, Value>>>,
            Json(request): Json<Value>,
        ) -> Json<Value> {
            let method = request["method"].as_str().unwrap_or_default();
            let result = responses.get(method).cloned().unwrap_or(Value::Null);
            Json(json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }))
        }

        let app = Router::new().route("/", post(handle)).with_state(Arc::new(responses));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn mainnet_node() -> HashMap<&'static str, Value> {
        HashMap::from([
            ("eth_chainId", json!("0x1")),
            ("eth_blockNumber", json!("0x10d4f2a")),
            ("net_version", json!("1")),
            ("eth_syncing", json!(false)),
        ])
    }

    fn fixtures(network_name: &str) -> (Arc<ResultsStore>, ResultSink, Check, Service, Member) {
        let store = Arc::new(ResultsStore::new());
        let sink = ResultSink::new(Arc::clone(&store), Arc::new(RecordingBus::default()), "n1");
        let check = Check { name: "ethrpc".to_string(), ..Check::default() };
        let service = Service {
            configuration: ServiceConfiguration {
                service_type: "ETHRPC".to_string(),
                network_name: network_name.to_string(),
                ..ServiceConfiguration::default()
            },
            ..Service::default()
        };
        let mut member =
            Member { details: MemberDetails { name: "m1".to_string() }, ..Member::default() };
        member.service.service_ipv4 = "127.0.0.1".to_string();
        (store, sink, check, service, member)
    }

    fn endpoint_key(endpoint: &str) -> EndpointKey {
        EndpointKey {
            check: "ethrpc".to_string(),
            member: "m1".to_string(),
            domain: "eth.test".to_string(),
            endpoint: endpoint.to_string(),
            ipv6: false,
        }
    }

    #[test]
    fn websocket_schemes_are_rewritten_to_http() {
        let wss = parse_endpoint_url("wss://eth.example.com/rpc").unwrap();
        assert_eq!(http_url(&wss), "https://eth.example.com/rpc");

        let ws = parse_endpoint_url("ws://eth.example.com:8546/rpc").unwrap();
        assert_eq!(http_url(&ws), "http://eth.example.com:8546/rpc");

        let https = parse_endpoint_url("https://eth.example.com/rpc").unwrap();
        assert_eq!(http_url(&https), "https://eth.example.com/rpc");
    }

    #[tokio::test]
    async fn network_match_via_decimal_chain_id() {
        let (store, sink, check, service, member) = fixtures("1");
        let port = spawn_rpc_server(mainnet_node()).await;
        let endpoint = format!("ws://eth.test:{port}/");

        EthRpcProbe::new().run(&sink, &check, &endpoint, &service, &member).await;

        let result = store.local_endpoint(&endpoint_key(&endpoint)).await.unwrap();
        assert!(result.status, "unexpected failure: {}", result.error_text);
        let data = result.data.unwrap();
        assert_eq!(data["chainId"], json!("0x1"));
        assert_eq!(data["chainIdDec"], json!(1));
        assert_eq!(data["netVersion"], json!("1"));
        assert_eq!(data["syncing"], json!(false));
    }

    #[tokio::test]
    async fn network_match_via_hex_chain_id() {
        // Moonbeam-style catalogs carry the hex chainId as the network name.
        let (store, sink, check, service, member) = fixtures("0x504");
        let mut responses = mainnet_node();
        responses.insert("eth_chainId", json!("0x504"));
        responses.insert("net_version", json!("1284"));
        let port = spawn_rpc_server(responses).await;
        let endpoint = format!("ws://eth.test:{port}/");

        EthRpcProbe::new().run(&sink, &check, &endpoint, &service, &member).await;

        assert!(store.local_endpoint(&endpoint_key(&endpoint)).await.unwrap().status);
    }

    #[tokio::test]
    async fn syncing_object_marks_the_node_as_syncing() {
        let (store, sink, check, service, member) = fixtures("1");
        let mut responses = mainnet_node();
        responses.insert("eth_syncing", json!({ "startingBlock": "0x0", "currentBlock": "0x10" }));
        let port = spawn_rpc_server(responses).await;
        let endpoint = format!("ws://eth.test:{port}/");

        EthRpcProbe::new().run(&sink, &check, &endpoint, &service, &member).await;

        let result = store.local_endpoint(&endpoint_key(&endpoint)).await.unwrap();
        assert!(!result.status);
        assert_eq!(result.error_text, "Node is syncing");
    }

    #[tokio::test]
    async fn wrong_network_reports_all_three_forms() {
        let (store, sink, check, service, member) = fixtures("137");
        let port = spawn_rpc_server(mainnet_node()).await;
        let endpoint = format!("ws://eth.test:{port}/");

        EthRpcProbe::new().run(&sink, &check, &endpoint, &service, &member).await;

        let result = store.local_endpoint(&endpoint_key(&endpoint)).await.unwrap();
        assert!(!result.status);
        assert_eq!(
            result.error_text,
            "Wrong network: expected 137, got net_version=1 chainId=0x1 (decimal=1)"
        );
    }

    #[tokio::test]
    async fn unreachable_node_fails_on_the_first_call() {
        let (store, sink, check, service, member) = fixtures("1");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut check = check;
        check.extra_options.insert("ConnectTimeout".to_string(), json!(1));
        let endpoint = format!("ws://eth.test:{port}/");

        EthRpcProbe::new().run(&sink, &check, &endpoint, &service, &member).await;

        let result = store.local_endpoint(&endpoint_key(&endpoint)).await.unwrap();
        assert!(!result.status);
        assert!(result.error_text.starts_with("eth_chainId failed:"));
    }

    #[tokio::test]
    async fn member_without_addresses_records_one_failure() {
        let (store, sink, check, service, mut member) = fixtures("1");
        member.service.service_ipv4 = String::new();
        let endpoint = "wss://eth.test/";

        EthRpcProbe::new().run(&sink, &check, endpoint, &service, &member).await;

        let result = store.local_endpoint(&endpoint_key(endpoint)).await.unwrap();
        assert!(!result.status);
        assert_eq!(result.error_text, "No IPv4 or IPv6 configured");
        assert!(!result.is_ipv6);
    }
}
