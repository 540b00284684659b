//! External collaborators consumed by the orchestrator
//!
//! DNS, certificate issuance and the application catalog are owned by other
//! services; the engine only depends on these traits.

pub mod catalog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// A DNS zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
}

/// DNS provider operations used for address records
#[async_trait]
pub trait DnsGateway: Send + Sync {
    /// Find the zone serving `domain`
    async fn find_zone(&self, domain: &str) -> Result<Zone, EngineError>;

    /// Create or replace an A record
    async fn upsert_a_record(&self, zone: &Zone, name: &str, ipv4: &str) -> Result<(), EngineError>;

    /// Delete an A record. Deleting an absent record is not an error.
    async fn delete_a_record(&self, zone: &Zone, name: &str) -> Result<(), EngineError>;
}

/// Certificate material produced by the issuance workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsBundle {
    /// PEM certificate chain
    pub certificate: String,

    /// PEM private key
    pub private_key: String,

    pub zone_id: String,
}

/// Certificate issuance workflow of the DNS/TLS provider
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Issue a certificate covering `domain` and `*.domain`.
    ///
    /// `csr` is the shared signing request template, when one is configured.
    async fn issue(&self, domain: &str, zone: &Zone, csr: Option<&str>) -> Result<TlsBundle, EngineError>;
}

/// Stand-in for deployments without a DNS/TLS provider. Every call fails, so
/// catalog entries that need DNS cannot be deployed.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredGateway;

impl UnconfiguredGateway {
    fn error() -> EngineError {
        EngineError::GatewayError("no DNS/TLS provider is configured".to_string())
    }
}

#[async_trait]
impl DnsGateway for UnconfiguredGateway {
    async fn find_zone(&self, _domain: &str) -> Result<Zone, EngineError> {
        Err(Self::error())
    }

    async fn upsert_a_record(&self, _zone: &Zone, _name: &str, _ipv4: &str) -> Result<(), EngineError> {
        Err(Self::error())
    }

    async fn delete_a_record(&self, _zone: &Zone, _name: &str) -> Result<(), EngineError> {
        Err(Self::error())
    }
}

#[async_trait]
impl CertificateIssuer for UnconfiguredGateway {
    async fn issue(&self, _domain: &str, _zone: &Zone, _csr: Option<&str>) -> Result<TlsBundle, EngineError> {
        Err(Self::error())
    }
}
