//! Site-level ICMP probe. Sends a short burst of echoes per address family
//! and gates on packet loss and average round-trip time.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use rand::random;
use serde_json::json;
use surge_ping::{Client, Config as PingConfig, ICMP, PingIdentifier, PingSequence};
use tracing::debug;

use crate::config::{Check, Member};
use crate::monitoring::registry::SiteProbe;
use crate::monitoring::sink::ResultSink;
use crate::monitoring::util::{float_option, int_option};
use crate::results::DataMap;

#[derive(Default)]
pub struct PingProbe;

impl PingProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SiteProbe for PingProbe {
    async fn run(&self, sink: &ResultSink, check: &Check, member: &Member) {
        if !member.service.service_ipv4.is_empty() {
            run_ping_single(sink, check, member, false).await;
        }
        if !member.service.service_ipv6.is_empty() {
            run_ping_single(sink, check, member, true).await;
        }
    }
}

async fn run_ping_single(sink: &ResultSink, check: &Check, member: &Member, is_ipv6: bool) {
    let count = int_option(&check.extra_options, "PingCount", 3).max(1) as usize;
    let interval =
        Duration::from_millis(int_option(&check.extra_options, "PingInterval", 100).max(0) as u64);
    let ping_timeout =
        Duration::from_millis(int_option(&check.extra_options, "PingTimeout", 1000).max(1) as u64);
    let payload_size = int_option(&check.extra_options, "PingSize", 32).max(0) as usize;
    let ttl = int_option(&check.extra_options, "PingTTL", 64).clamp(1, 255) as u32;
    let max_packet_loss = float_option(&check.extra_options, "MaxPacketLoss", 5.0);
    let max_latency_ms = int_option(&check.extra_options, "MaxLatency", 800);

    let address: IpAddr = match member.ip(is_ipv6).parse() {
        Ok(address) => address,
        Err(error) => {
            sink.update_site_result_local(
                check,
                member,
                false,
                &format!("Ping error init: {error}"),
                None,
                is_ipv6,
            )
            .await;
            return;
        }
    };

    let mut config = PingConfig::builder().ttl(ttl);
    if is_ipv6 {
        config = config.kind(ICMP::V6);
    }
    let client = match Client::new(&config.build()) {
        Ok(client) => client,
        Err(error) => {
            sink.update_site_result_local(
                check,
                member,
                false,
                &format!("Ping error init: {error}"),
                None,
                is_ipv6,
            )
            .await;
            return;
        }
    };

    let mut pinger = client.pinger(address, PingIdentifier(random())).await;

    // One deadline of PingTimeout x PingCount bounds the whole burst;
    // echoes that do not fit count as lost.
    let deadline = tokio::time::Instant::now() + ping_timeout * count as u32;
    let payload = vec![0u8; payload_size];
    let mut rtts = Vec::with_capacity(count);
    for sequence in 0..count {
        if sequence > 0 {
            tokio::time::sleep(interval).await;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        pinger.timeout(remaining);
        if let Ok((_, rtt)) = pinger.ping(PingSequence(sequence as u16), &payload).await {
            rtts.push(rtt);
        }
    }

    let stats = PingStats::from_rtts(count, &rtts);
    let success = stats.received > 0
        && stats.packet_loss <= max_packet_loss
        && stats.avg_ms <= max_latency_ms;
    let message = if success {
        String::new()
    } else {
        format!("PingCheck: avgRtt={}ms, loss={:.0}%", stats.avg_ms, stats.packet_loss)
    };

    let mut data = DataMap::new();
    data.insert("PacketLoss".to_string(), json!(stats.packet_loss));
    data.insert("MinRtt".to_string(), json!(stats.min_ms));
    data.insert("AvgRtt".to_string(), json!(stats.avg_ms));
    data.insert("MaxRtt".to_string(), json!(stats.max_ms));
    data.insert("StdDevRtt".to_string(), json!(stats.stddev_ms));

    sink.update_site_result_local(check, member, success, &message, Some(data), is_ipv6).await;
    debug!(member = %member.details.name, is_ipv6, success, "Ping check completed");
}

#[derive(Debug, PartialEq)]
struct PingStats {
    received: usize,
    packet_loss: f64,
    min_ms: i64,
    avg_ms: i64,
    max_ms: i64,
    stddev_ms: i64,
}

impl PingStats {
    fn from_rtts(sent: usize, rtts: &[Duration]) -> Self {
        let received = rtts.len();
        let packet_loss =
            if sent == 0 { 0.0 } else { (sent - received) as f64 / sent as f64 * 100.0 };
        if received == 0 {
            return Self { received, packet_loss, min_ms: 0, avg_ms: 0, max_ms: 0, stddev_ms: 0 };
        }
        let samples_ms: Vec<f64> = rtts.iter().map(|rtt| rtt.as_secs_f64() * 1000.0).collect();
        let min = samples_ms.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples_ms.iter().cloned().fold(0.0_f64, f64::max);
        let avg = samples_ms.iter().sum::<f64>() / received as f64;
        let variance =
            samples_ms.iter().map(|sample| (sample - avg).powi(2)).sum::<f64>() / received as f64;
        Self {
            received,
            packet_loss,
            min_ms: min as i64,
            avg_ms: avg as i64,
            max_ms: max as i64,
            stddev_ms: variance.sqrt() as i64,
        }
    }
}
