//! Built-in probe implementations.
//!
//! Every probe follows the same rules: transports are dialed to the member's
//! declared IP while the URL's hostname goes into SNI and the Host header,
//! timeouts come from the check's ExtraOptions, and failures are reported
//! through the result sink rather than returned to the caller.

pub mod ethrpc;
pub mod ping;
pub mod ssl;
pub mod wss;

use std::sync::{Arc, Once};

use rustls::{ClientConfig, RootCertStore};

use super::registry::CheckRegistry;

static CRYPTO_PROVIDER: Once = Once::new();

/// Pin the process-level rustls crypto provider. Several dependencies pull
/// in different providers; without an explicit default the config builders
/// refuse to choose one.
pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Register every built-in check under the name the configuration uses.
pub fn register_builtin(registry: &mut CheckRegistry) {
    registry.register_site_check("ping", Arc::new(ping::PingProbe::new()));
    registry.register_domain_check_with_types("ssl", Arc::new(ssl::SslProbe::new()), &["RPC", "ETHRPC"]);
    registry.register_endpoint_check_with_types("wss", Arc::new(wss::WssProbe::new()), &["RPC"]);
    registry.register_endpoint_check_with_types("ethrpc", Arc::new(ethrpc::EthRpcProbe::new()), &["ETHRPC"]);
}

/// The Mozilla root set used for full certificate verification.
pub(crate) fn tls_root_store() -> RootCertStore {
    RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.to_vec() }
}

pub(crate) fn tls_client_config(roots: RootCertStore) -> Arc<ClientConfig> {
    ensure_crypto_provider();
    Arc::new(ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
}
