//! Endpoint-level Substrate WebSocket probe. Opens the socket against the
//! member's IP with SNI set to the URL's hostname, then walks a fixed
//! sequence of JSON-RPC calls: latest block hash, genesis block hash
//! (archive proof), chain identity (optionally anchored to the genesis
//! state root) and node health.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rustls::ClientConfig;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config};
use tracing::debug;

use crate::config::{Check, Member, Service};
use crate::monitoring::registry::EndpointProbe;
use crate::monitoring::sink::ResultSink;
use crate::monitoring::util::{int_option, parse_endpoint_url};
use crate::results::DataMap;

/// system_health must report strictly more peers than this.
const MIN_PEERS: f64 = 5.0;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

pub struct WssProbe {
    tls_config: Arc<ClientConfig>,
}

impl WssProbe {
    pub fn new() -> Self {
        Self { tls_config: super::tls_client_config(super::tls_root_store()) }
    }
}

impl Default for WssProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EndpointProbe for WssProbe {
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
            self.check_single(sink, check, endpoint, service, member, false).await;
        }
        if has_v6 {
            self.check_single(sink, check, endpoint, service, member, true).await;
        }
    }
}

impl WssProbe {
    async fn check_single(
        &self,
        sink: &ResultSink,
        check: &Check,
        endpoint: &str,
        service: &Service,
        member: &Member,
        is_ipv6: bool,
    ) {
        match self.run_protocol(check, endpoint, service, member.ip(is_ipv6)).await {
            Ok(data) => {
                sink.update_endpoint_result_local(check, endpoint, member, true, "", Some(data), is_ipv6)
                    .await;
                debug!(member = %member.details.name, endpoint, is_ipv6, success = true, "WSS check completed");
            }
            Err(reason) => {
                sink.update_endpoint_result_local(check, endpoint, member, false, &reason, None, is_ipv6)
                    .await;
                debug!(member = %member.details.name, endpoint, is_ipv6, success = false, "WSS check completed");
            }
        }
    }

    async fn run_protocol(
        &self,
        check: &Check,
        endpoint: &str,
        service: &Service,
        ip: &str,
    ) -> Result<DataMap, String> {
        let parsed = parse_endpoint_url(endpoint)
            .ok_or_else(|| format!("Invalid endpoint URL: {endpoint}"))?;
        let address: IpAddr =
            ip.parse().map_err(|_| format!("Failed to connect on IP={ip} => invalid address"))?;
        let connect_timeout = Duration::from_secs(
            int_option(&check.extra_options, "ConnectTimeout", 10).max(1) as u64,
        );
        let read_timeout =
            Duration::from_secs(int_option(&check.extra_options, "ReadTimeout", 15).max(1) as u64);

        let stream = timeout(connect_timeout, TcpStream::connect((address, parsed.port_or_default())))
            .await
            .map_err(|_| format!("Failed to connect on IP={ip} => timed out"))?
            .map_err(|error| format!("Failed to connect on IP={ip} => {error}"))?;

        let url = parsed.to_url_string();
        let connector = Connector::Rustls(Arc::clone(&self.tls_config));
        let (mut socket, _response) = timeout(
            connect_timeout,
            client_async_tls_with_config(url.as_str(), stream, None, Some(connector)),
        )
        .await
        .map_err(|_| format!("Failed to connect on IP={ip} => handshake timed out"))?
        .map_err(|error| format!("Failed to connect on IP={ip} => {error}"))?;

        // Latest block hash: the node answers queries at all.
        let latest = rpc_call(
            &mut socket,
            "chain_getBlockHash",
            json!(["latest"]),
            1,
            read_timeout,
            "chain_getBlockHash(latest)",
        )
        .await?;
        if latest.as_str().unwrap_or_default().is_empty() {
            return Err("Invalid chain_getBlockHash(latest) response".to_string());
        }

        // Genesis block hash: proves archive availability.
        let genesis = rpc_call(
            &mut socket,
            "chain_getBlockHash",
            json!([0]),
            2,
            read_timeout,
            "chain_getBlockHash(0)",
        )
        .await
        .map_err(|error| format!("Full archive check failed: {error}"))?;
        if genesis.as_str().unwrap_or_default().is_empty() {
            return Err("Not a full archive node".to_string());
        }

        self.verify_network(&mut socket, service, read_timeout).await?;

        // Node health: enough peers and done syncing.
        let health = rpc_call(&mut socket, "system_health", json!([]), 6, read_timeout, "system_health")
            .await
            .map_err(|error| format!("Peer check failed: {error}"))?;
        // Accept any JSON-number encoding of the peer count, not just
        // integers.
        let peers = health
            .get("peers")
            .and_then(Value::as_f64)
            .ok_or_else(|| "Peer check failed: invalid peers field".to_string())?;
        let is_syncing = health
            .get("isSyncing")
            .and_then(Value::as_bool)
            .ok_or_else(|| "Peer check failed: invalid isSyncing field".to_string())?;
        if peers <= MIN_PEERS || is_syncing {
            return Err("Syncing or not enough peers".to_string());
        }

        let mut data = DataMap::new();
        data.insert("Syncing".to_string(), json!(false));
        data.insert("Peers".to_string(), json!(true));
        data.insert("Network".to_string(), json!(true));
        data.insert("Archive".to_string(), json!(true));
        Ok(data)
    }

    /// Compare system_chain against the expected network name, and when a
    /// genesis state root is configured, anchor the identity to it.
    async fn verify_network(
        &self,
        socket: &mut WsStream,
        service: &Service,
        read_timeout: Duration,
    ) -> Result<(), String> {
        let chain = rpc_call(socket, "system_chain", json!([]), 3, read_timeout, "system_chain")
            .await
            .map_err(|error| format!("Network check failed: {error}"))?;
        let chain_name = chain
            .as_str()
            .ok_or_else(|| "Network check failed: invalid system_chain result".to_string())?;
        if !chain_name.eq_ignore_ascii_case(&service.configuration.network_name) {
            return Err("Wrong network".to_string());
        }

        let expected_state_root = &service.configuration.state_root_hash;
        if expected_state_root.is_empty() {
            return Ok(());
        }

        let genesis = rpc_call(
            socket,
            "chain_getBlockHash",
            json!([0]),
            4,
            read_timeout,
            "chain_getBlockHash(0)",
        )
        .await
        .map_err(|error| format!("Network check failed: {error}"))?;
        let genesis_hash = genesis.as_str().unwrap_or_default().to_string();
        if genesis_hash.is_empty() {
            return Err("Network check failed: invalid genesis block hash response".to_string());
        }

        let header = rpc_call(
            socket,
            "chain_getHeader",
            json!([genesis_hash]),
            5,
            read_timeout,
            "chain_getHeader(genesis)",
        )
        .await
        .map_err(|error| format!("Network check failed: {error}"))?;
        let state_root = header
            .get("stateRoot")
            .and_then(Value::as_str)
            .ok_or_else(|| "Network check failed: state root not found in genesis header".to_string())?;
        if !state_root.eq_ignore_ascii_case(expected_state_root) {
            return Err(format!(
                "Network check failed: genesis state root mismatch: expected {expected_state_root}, got {state_root}"
            ));
        }
        Ok(())
    }
}

/// Send one JSON-RPC request and read its reply, bounded by the read
/// deadline. Control frames are skipped; a JSON-RPC error object fails the
/// call.
async fn rpc_call(
    socket: &mut WsStream,
    method: &str,
    params: Value,
    id: u64,
    read_timeout: Duration,
    description: &str,
) -> Result<Value, String> {
    let request = JsonRpcRequest { jsonrpc: "2.0", method, params, id };
    let text =
        serde_json::to_string(&request).map_err(|error| format!("{description}: {error}"))?;
    socket.send(Message::Text(text)).await.map_err(|_| "Failed to send JSON RPC".to_string())?;

    loop {
        let frame = timeout(read_timeout, socket.next())
            .await
            .map_err(|_| format!("{description}: read timed out"))?
            .ok_or_else(|| format!("{description}: connection closed"))?
            .map_err(|error| format!("{description}: {error}"))?;
        match frame {
            Message::Text(payload) => {
                let response: Value = serde_json::from_str(&payload)
                    .map_err(|error| format!("{description}: {error}"))?;
                if let Some(error) = response.get("error") {
                    if !error.is_null() {
                        return Err(format!("{description}: RPC error {error}"));
                    }
                }
                return Ok(response.get("result").cloned().unwrap_or(Value::Null));
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => return Err(format!("{description}: unexpected message")),
        }
    }
}
