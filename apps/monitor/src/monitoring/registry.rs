//! Check registry: name → probe tables for the three check buckets, plus the
//! service-type compatibility lists used by the enumerator. Registration
//! happens once at startup; afterwards the registry is read-only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Check, CheckType, Member, Service};
use crate::monitoring::sink::ResultSink;

/// A probe against the member host itself (no service context).
#[async_trait]
pub trait SiteProbe: Send + Sync {
    async fn run(&self, sink: &ResultSink, check: &Check, member: &Member);
}

/// A probe against a fronting hostname of a service.
#[async_trait]
pub trait DomainProbe: Send + Sync {
    async fn run(
        &self,
        sink: &ResultSink,
        check: &Check,
        domain: &str,
        service: &Service,
        member: &Member,
    );
}

/// A probe against one specific RPC URL of a service.
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    async fn run(
        &self,
        sink: &ResultSink,
        check: &Check,
        endpoint: &str,
        service: &Service,
        member: &Member,
    );
}

#[derive(Default)]
pub struct CheckRegistry {
    site: HashMap<String, Arc<dyn SiteProbe>>,
    domain: HashMap<String, Arc<dyn DomainProbe>>,
    endpoint: HashMap<String, Arc<dyn EndpointProbe>>,
    domain_types: HashMap<String, Vec<String>>,
    endpoint_types: HashMap<String, Vec<String>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_site_check(&mut self, name: &str, probe: Arc<dyn SiteProbe>) {
        self.site.insert(name.to_string(), probe);
    }

    pub fn register_domain_check(&mut self, name: &str, probe: Arc<dyn DomainProbe>) {
        self.domain.insert(name.to_string(), probe);
    }

    /// Register a domain check that only applies to some service types.
    pub fn register_domain_check_with_types(
        &mut self,
        name: &str,
        probe: Arc<dyn DomainProbe>,
        valid_types: &[&str],
    ) {
        self.domain.insert(name.to_string(), probe);
        self.domain_types
            .insert(name.to_string(), valid_types.iter().map(|t| t.to_string()).collect());
    }

    pub fn register_endpoint_check(&mut self, name: &str, probe: Arc<dyn EndpointProbe>) {
        self.endpoint.insert(name.to_string(), probe);
    }

    /// Register an endpoint check that only applies to some service types.
    pub fn register_endpoint_check_with_types(
        &mut self,
        name: &str,
        probe: Arc<dyn EndpointProbe>,
        valid_types: &[&str],
    ) {
        self.endpoint.insert(name.to_string(), probe);
        self.endpoint_types
            .insert(name.to_string(), valid_types.iter().map(|t| t.to_string()).collect());
    }

    pub fn site_check(&self, name: &str) -> Option<Arc<dyn SiteProbe>> {
        self.site.get(name).cloned()
    }

    pub fn domain_check(&self, name: &str) -> Option<Arc<dyn DomainProbe>> {
        self.domain.get(name).cloned()
    }

    pub fn endpoint_check(&self, name: &str) -> Option<Arc<dyn EndpointProbe>> {
        self.endpoint.get(name).cloned()
    }

    /// Whether a (check, service type) pair is eligible for enumeration.
    /// Registration without a type list means "compatible with all"; site
    /// checks carry no service context and are always eligible.
    pub fn is_valid_for_service_type(
        &self,
        check_name: &str,
        check_type: CheckType,
        service_type: &str,
    ) -> bool {
        let valid_types = match check_type {
            CheckType::Site => return true,
            CheckType::Domain => self.domain_types.get(check_name),
            CheckType::Endpoint => self.endpoint_types.get(check_name),
        };
        match valid_types {
            None => true,
            Some(types) if types.is_empty() => true,
            Some(types) => types.iter().any(|t| t.eq_ignore_ascii_case(service_type)),
        }
    }
}
