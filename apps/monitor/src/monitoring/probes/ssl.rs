//! Domain-level TLS certificate probe. Dials the member's IP directly while
//! presenting the fronting hostname in SNI, verifies the chain fully, and
//! fails the check when the leaf certificate is close to expiry.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use x509_parser::prelude::parse_x509_certificate;

use crate::config::{Check, Member, Service};
use crate::monitoring::registry::DomainProbe;
use crate::monitoring::sink::ResultSink;
use crate::monitoring::util::int_option;
use crate::results::DataMap;

const TLS_PORT: u16 = 443;
const MIN_DAYS_TO_EXPIRY: i64 = 5;
const SECONDS_PER_DAY: i64 = 86_400;

pub struct SslProbe {
    port: u16,
    tls_config: Arc<ClientConfig>,
}

impl SslProbe {
    pub fn new() -> Self {
        Self { port: TLS_PORT, tls_config: super::tls_client_config(super::tls_root_store()) }
    }

    #[cfg(test)]
    fn with_roots(port: u16, roots: rustls::RootCertStore) -> Self {
        Self { port, tls_config: super::tls_client_config(roots) }
    }
}

impl Default for SslProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DomainProbe for SslProbe {
    async fn run(
        &self,
        sink: &ResultSink,
        check: &Check,
        domain: &str,
        _service: &Service,
        member: &Member,
    ) {
        if !member.service.service_ipv4.is_empty() {
            self.check_single(sink, check, domain, member, false).await;
        }
        if !member.service.service_ipv6.is_empty() {
            self.check_single(sink, check, domain, member, true).await;
        }
    }
}

impl SslProbe {
    async fn check_single(
        &self,
        sink: &ResultSink,
        check: &Check,
        domain: &str,
        member: &Member,
        is_ipv6: bool,
    ) {
        let connect_timeout =
            Duration::from_secs(int_option(&check.extra_options, "ConnectTimeout", 5).max(1) as u64);

        match self.inspect_certificate(domain, member.ip(is_ipv6), connect_timeout).await {
            Ok((expiry_timestamp, days_until_expiry)) => {
                let mut data = DataMap::new();
                data.insert("ExpiryTimestamp".to_string(), json!(expiry_timestamp));
                data.insert("DaysUntilExpiry".to_string(), json!(days_until_expiry));

                let success = days_until_expiry >= MIN_DAYS_TO_EXPIRY;
                let error_text = if success { "" } else { "Less than 5 days to expiry" };
                sink.update_domain_result_local(
                    check, domain, member, success, error_text, Some(data), is_ipv6,
                )
                .await;
                debug!(member = %member.details.name, domain, is_ipv6, success, "SSL check completed");
            }
            Err(reason) => {
                sink.update_domain_result_local(check, domain, member, false, &reason, None, is_ipv6)
                    .await;
                debug!(member = %member.details.name, domain, is_ipv6, success = false, "SSL check completed");
            }
        }
    }

    /// Handshake against the member replica and read the leaf certificate.
    /// Returns the expiry as (unix timestamp, whole days from now).
    async fn inspect_certificate(
        &self,
        domain: &str,
        ip: &str,
        connect_timeout: Duration,
    ) -> Result<(i64, i64), String> {
        let address: IpAddr =
            ip.parse().map_err(|error| format!("TCP connect error: {error}"))?;
        let stream = timeout(connect_timeout, TcpStream::connect((address, self.port)))
            .await
            .map_err(|_| "TCP connect error: timed out".to_string())?
            .map_err(|error| format!("TCP connect error: {error}"))?;

        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|error| format!("TLS handshake failed: {error}"))?;
        let connector = TlsConnector::from(Arc::clone(&self.tls_config));
        let tls_stream = timeout(connect_timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| "TLS handshake failed: timed out".to_string())?
            .map_err(|error| format!("TLS handshake failed: {error}"))?;

        let (_, connection) = tls_stream.get_ref();
        let leaf = connection
            .peer_certificates()
            .and_then(|certificates| certificates.first())
            .ok_or_else(|| "No certificate found".to_string())?;
        let (_, certificate) = parse_x509_certificate(leaf.as_ref())
            .map_err(|_| "Certificate parse error".to_string())?;

        let expiry_timestamp = certificate.validity().not_after.timestamp();
        let days_until_expiry = (expiry_timestamp - Utc::now().timestamp()) / SECONDS_PER_DAY;
        Ok((expiry_timestamp, days_until_expiry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use rcgen::{CertificateParams, KeyPair};
    use rustls::RootCertStore;
    use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;
    use tokio_rustls::TlsAcceptor;

    use crate::bus::{StatusBus, StatusProposal};
    use crate::config::MemberDetails;
    use crate::results::{DomainKey, ResultsStore};

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

    /// Spawn a one-shot TLS server for `domain` whose certificate expires in
    /// `days` days. Returns the listen port and a root store trusting it.
    async fn spawn_tls_server(domain: &str, days: i64) -> (u16, RootCertStore) {
        crate::monitoring::probes::ensure_crypto_provider();
        let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
        params.not_after =
            time::OffsetDateTime::now_utc() + time::Duration::days(days) + time::Duration::hours(1);
        let key_pair = KeyPair::generate().unwrap();
        let certificate = params.self_signed(&key_pair).unwrap();

        let cert_der: CertificateDer<'static> = certificate.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut roots = RootCertStore::empty();
        roots.add(cert_der.clone()).unwrap();

        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                    // Hold the connection until the client hangs up.
                    let mut buffer = [0u8; 1];
                    let _ = tls_stream.read(&mut buffer).await;
                }
            }
        });
        (port, roots)
    }

    fn fixtures() -> (Arc<ResultsStore>, ResultSink, Check, Member) {
        let store = Arc::new(ResultsStore::new());
        let sink = ResultSink::new(Arc::clone(&store), Arc::new(RecordingBus::default()), "n1");
        let check = Check { name: "ssl".to_string(), ..Check::default() };
        let mut member =
            Member { details: MemberDetails { name: "m1".to_string() }, ..Member::default() };
        member.service.service_ipv4 = "127.0.0.1".to_string();
        (store, sink, check, member)
    }

    fn domain_key(domain: &str) -> DomainKey {
        DomainKey {
            check: "ssl".to_string(),
            member: "m1".to_string(),
            domain: domain.to_string(),
            ipv6: false,
        }
    }

    #[tokio::test]
    async fn near_expiry_certificate_fails_the_check() {
        let (store, sink, check, member) = fixtures();
        let (port, roots) = spawn_tls_server("ssl.test", 3).await;
        let probe = SslProbe::with_roots(port, roots);

        probe.check_single(&sink, &check, "ssl.test", &member, false).await;

        let result = store.local_domain(&domain_key("ssl.test")).await.unwrap();
        assert!(!result.status);
        assert_eq!(result.error_text, "Less than 5 days to expiry");
        let data = result.data.unwrap();
        assert_eq!(data["DaysUntilExpiry"], json!(3));
        assert!(data["ExpiryTimestamp"].as_i64().unwrap() > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn healthy_certificate_passes_with_expiry_data() {
        let (store, sink, check, member) = fixtures();
        let (port, roots) = spawn_tls_server("ssl.test", 90).await;
        let probe = SslProbe::with_roots(port, roots);

        probe.check_single(&sink, &check, "ssl.test", &member, false).await;

        let result = store.local_domain(&domain_key("ssl.test")).await.unwrap();
        assert!(result.status);
        assert!(result.error_text.is_empty());
        assert_eq!(result.data.unwrap()["DaysUntilExpiry"], json!(90));
    }

    #[tokio::test]
    async fn untrusted_certificate_is_a_handshake_failure() {
        let (store, sink, check, member) = fixtures();
        // Server cert for ssl.test, but the probe only trusts the webpki roots.
        let (port, _roots) = spawn_tls_server("ssl.test", 90).await;
        let probe = SslProbe::with_roots(port, RootCertStore::empty());

        probe.check_single(&sink, &check, "ssl.test", &member, false).await;

        let result = store.local_domain(&domain_key("ssl.test")).await.unwrap();
        assert!(!result.status);
        assert!(result.error_text.starts_with("TLS handshake failed:"));
    }

    #[tokio::test]
    async fn unreachable_member_reports_tcp_error() {
        let (store, sink, check, member) = fixtures();
        // Bind a listener and drop it so the port is (very likely) closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = SslProbe::with_roots(port, RootCertStore::empty());
        probe.check_single(&sink, &check, "ssl.test", &member, false).await;

        let result = store.local_domain(&domain_key("ssl.test")).await.unwrap();
        assert!(!result.status);
        assert!(result.error_text.starts_with("TCP connect error:"));
    }
}
