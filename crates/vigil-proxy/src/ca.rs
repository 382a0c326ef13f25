//! In-memory certificate authority for TLS interception.
//!
//! Generates a root CA keypair and self-signed certificate at construction,
//! persists the certificate (never the private key) as a PEM file for user
//! inspection, and mints per-host leaf certificates on demand. Leaf
//! certificates are cached for the life of the store and come bundled with
//! a ready-to-serve `rustls::ServerConfig` carrying the leaf + root chain.
//!
//! Concurrency: lookups of cached hosts take a read lock only. A cold host
//! gets a per-host issuance cell, so two threads racing on the same
//! hostname serialize against each other (the loser receives the winner's
//! certificate) while issuance for other hostnames proceeds in parallel.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::error::{CryptoError, TrustStoreError};
use crate::keys::KeyPairFactory;
use crate::trust::{native_trust_store, TrustStore};

/// Identity fields for the self-signed root certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaIdentity {
    pub country: String,
    pub organization: String,
    pub common_name: String,
}

impl Default for CaIdentity {
    fn default() -> Self {
        Self {
            country: "US".to_string(),
            organization: "Vigil".to_string(),
            common_name: "Vigil Root CA".to_string(),
        }
    }
}

impl CaIdentity {
    /// Creates an identity from the three distinguished-name fields.
    pub fn new(
        country: impl Into<String>,
        organization: impl Into<String>,
        common_name: impl Into<String>,
    ) -> Self {
        Self {
            country: country.into(),
            organization: organization.into(),
            common_name: common_name.into(),
        }
    }

    /// Filesystem-safe stem derived from the common name.
    pub fn file_stem(&self) -> String {
        self.common_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect()
    }
}

/// The root authority: signing issuer plus its self-signed certificate.
/// The private key lives inside the issuer and never leaves process
/// memory.
struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

/// A leaf certificate issued for one hostname, shared by every connection
/// to that hostname. Never persisted.
pub struct HostCertificate {
    hostname: String,
    cert_pem: String,
    chain: Vec<CertificateDer<'static>>,
    server_config: Arc<ServerConfig>,
    issued_at: DateTime<Utc>,
}

impl HostCertificate {
    /// The hostname this certificate was minted for.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The leaf certificate in PEM encoding.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The DER chain presented to clients: leaf first, then the root.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Ready-to-serve TLS configuration for the external pipeline.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// When this certificate was issued.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

type HostCell = Arc<OnceCell<Arc<HostCertificate>>>;

/// Owns the root authority and the per-host leaf certificate cache, and
/// manages OS trust for the root.
pub struct CertificateStore {
    identity: CaIdentity,
    cert_path: PathBuf,
    root: RootAuthority,
    hosts: RwLock<HashMap<String, HostCell>>,
    trust: Box<dyn TrustStore>,
    trust_established: AtomicBool,
}

impl CertificateStore {
    /// Generates a fresh root authority bound to `identity` and writes its
    /// certificate (not the key) to `<ca_dir>/<common name>.pem`.
    ///
    /// Fails with [`CryptoError`] if keypair generation or self-signing
    /// fails; no partially constructed store is observable.
    pub fn new(identity: CaIdentity, ca_dir: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::with_trust_store(identity, ca_dir, native_trust_store())
    }

    /// Like [`CertificateStore::new`] with the default identity.
    pub fn with_defaults(ca_dir: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::new(CaIdentity::default(), ca_dir)
    }

    /// Constructs a store using a caller-supplied trust capability instead
    /// of the platform one.
    pub fn with_trust_store(
        identity: CaIdentity,
        ca_dir: impl AsRef<Path>,
        trust: Box<dyn TrustStore>,
    ) -> Result<Self, CryptoError> {
        let root = Self::generate_root(&identity)?;

        let ca_dir = ca_dir.as_ref();
        fs::create_dir_all(ca_dir)?;
        let cert_path = ca_dir.join(format!("{}.pem", identity.file_stem()));
        fs::write(&cert_path, &root.cert_pem)?;
        tracing::info!(path = %cert_path.display(), "root CA certificate written");

        Ok(Self {
            identity,
            cert_path,
            root,
            hosts: RwLock::new(HashMap::new()),
            trust,
            trust_established: AtomicBool::new(false),
        })
    }

    fn generate_root(identity: &CaIdentity) -> Result<RootAuthority, CryptoError> {
        let key = KeyPairFactory::generate()?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, identity.country.clone());
        dn.push(DnType::OrganizationName, identity.organization.clone());
        dn.push(DnType::CommonName, identity.common_name.clone());
        params.distinguished_name = dn;

        let cert = params
            .self_signed(&key)
            .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;
        let cert_pem = cert.pem();
        let cert_der = cert.der().clone();

        Ok(RootAuthority {
            issuer: Issuer::new(params, key),
            cert_pem,
            cert_der,
        })
    }

    /// The root identity.
    pub fn identity(&self) -> &CaIdentity {
        &self.identity
    }

    /// Where the root certificate PEM was persisted.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// The root certificate in PEM encoding.
    pub fn root_ca_pem(&self) -> String {
        self.root.cert_pem.clone()
    }

    /// Number of hostnames with a cached leaf certificate.
    pub fn cached_host_count(&self) -> usize {
        self.hosts.read().len()
    }

    /// Returns the leaf certificate for `hostname`, minting and caching
    /// one on first request.
    ///
    /// Safe to call concurrently from many threads. Two racing calls for
    /// the same uncached hostname produce exactly one issuance; the second
    /// caller receives the first caller's certificate. Issuance for other
    /// hostnames is never blocked.
    pub fn issue_host_certificate(
        &self,
        hostname: &str,
    ) -> Result<Arc<HostCertificate>, CryptoError> {
        let hostname = normalize_host(hostname);

        let cell = {
            let hosts = self.hosts.read();
            hosts.get(&hostname).cloned()
        };
        let cell = match cell {
            Some(cell) => cell,
            None => {
                let mut hosts = self.hosts.write();
                hosts
                    .entry(hostname.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            }
        };

        cell.get_or_try_init(|| self.issue(&hostname)).cloned()
    }

    fn issue(&self, hostname: &str) -> Result<Arc<HostCertificate>, CryptoError> {
        let key = KeyPairFactory::generate()?;

        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname.to_string());
        params.distinguished_name = dn;

        if let Ok(ip) = hostname.parse::<IpAddr>() {
            params.subject_alt_names.push(SanType::IpAddress(ip));
        } else {
            let name = hostname
                .try_into()
                .map_err(|e: rcgen::Error| CryptoError::CertGeneration(e.to_string()))?;
            params.subject_alt_names.push(SanType::DnsName(name));
        }

        let cert = params
            .signed_by(&key, &self.root.issuer)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        let cert_pem = cert.pem();
        let leaf_der = cert.der().clone();
        let chain = vec![leaf_der, self.root.cert_der.clone()];

        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain.clone(), key_der)
            .map_err(|e| CryptoError::Tls(e.to_string()))?;

        tracing::debug!(hostname, "leaf certificate issued");

        Ok(Arc::new(HostCertificate {
            hostname: hostname.to_string(),
            cert_pem,
            chain,
            server_config: Arc::new(server_config),
            issued_at: Utc::now(),
        }))
    }

    /// Installs the root certificate into the OS trust store.
    ///
    /// The store's own state is unaffected by failure; interception keeps
    /// working for clients that trust the root manually.
    pub fn establish_os_trust(&self) -> Result<(), TrustStoreError> {
        self.trust.install(&self.cert_path)?;
        self.trust_established.store(true, Ordering::Release);
        tracing::info!(common_name = %self.identity.common_name, "root CA trusted by OS");
        Ok(())
    }

    /// Removes any root certificates this program previously installed,
    /// matched by common name. Best-effort idempotent: absence is not an
    /// error.
    pub fn revoke_os_trust(&self) {
        if let Err(err) = self.trust.revoke(&self.identity.common_name) {
            tracing::warn!(%err, "OS trust revoke failed");
        }
        self.trust_established.store(false, Ordering::Release);
    }

    /// Whether the root is currently present in the OS trust store.
    pub fn os_trust_installed(&self) -> bool {
        self.trust.is_installed(&self.identity.common_name)
    }
}

impl Drop for CertificateStore {
    fn drop(&mut self) {
        // Clean up OS state we created; key material is released with the
        // store. Must not panic.
        if self.trust_established.load(Ordering::Acquire) {
            self.revoke_os_trust();
        }
    }
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}
