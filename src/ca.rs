//! Certificate Authority — mints and persists the proxy's root CA, and
//! generates per-host leaf certificates on demand for MITM interception.

use crate::config::CaConfig;
use crate::error::{ProxyError, ProxyResult};
use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::EncodePrivateKey;
use rustls_pki_types::PrivatePkcs8KeyDer;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// Restrict the private key file to owner read/write (mode 0600). No-op
/// on platforms without POSIX permission bits.
#[cfg(unix)]
fn set_key_file_mode(key_path: &Path) -> ProxyResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(key_path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_key_file_mode(_key_path: &Path) -> ProxyResult<()> {
    Ok(())
}

/// A leaf certificate and key, DER-encoded and ready to feed into a
/// `rustls::ServerConfig`.
#[derive(Clone)]
pub struct Leaf {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Per-host lock so two concurrent connections to the same hitherto-unseen
/// host mint at most one certificate between them.
type HostLock = Arc<AsyncMutex<()>>;

/// Root CA plus a cache of minted leaf certificates.
pub struct CertificateAuthority {
    root_cert: Certificate,
    root_cert_pem: String,
    root_key: KeyPair,
    root_not_after: OffsetDateTime,
    leaf_validity: Duration,
    cache: DashMap<String, Leaf>,
    host_locks: DashMap<String, HostLock>,
}

impl CertificateAuthority {
    /// Load a CA from `cfg`, generating and persisting a fresh root if
    /// none exists yet (or loading the user-supplied custom root if
    /// configured).
    pub fn load_or_create(cfg: &CaConfig) -> ProxyResult<Self> {
        if let (Some(cert_path), Some(key_path)) = (&cfg.custom_cert_path, &cfg.custom_key_path) {
            return Self::load_from_files(cert_path, key_path, cfg.validity_days);
        }

        let cert_path = cfg.cert_dir.join("proxycraft-ca.pem");
        let key_path = cfg.cert_dir.join("proxycraft-ca-key.pem");

        if cert_path.exists() && key_path.exists() {
            info!(path = %cert_path.display(), "loading existing root CA");
            Self::load_from_files(&cert_path, &key_path, cfg.validity_days)
        } else {
            info!(path = %cert_path.display(), "minting new root CA");
            let ca = Self::generate_root(cfg.validity_days)?;
            ca.persist(&cert_path, &key_path)?;
            Ok(ca)
        }
    }

    fn generate_root(validity_days: i64) -> ProxyResult<Self> {
        let mut rng = rsa::rand_core::OsRng;
        let rsa_key = rsa::RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| ProxyError::CAInit(format!("rsa keygen failed: {e}")))?;
        let pkcs8_der = rsa_key
            .to_pkcs8_der()
            .map_err(|e| ProxyError::CAInit(format!("pkcs8 encode failed: {e}")))?;
        let root_key = KeyPair::from_der_and_sign_algo(
            &PrivatePkcs8KeyDer::from(pkcs8_der.as_bytes().to_vec()),
            &rcgen::PKCS_RSA_SHA256,
        )
        .map_err(|e| ProxyError::CAInit(format!("rcgen key import failed: {e}")))?;

        let now = OffsetDateTime::now_utc();
        let not_after = now + Duration::days(validity_days);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "proxycraft Root CA");
        dn.push(DnType::OrganizationName, "proxycraft");
        params.distinguished_name = dn;
        params.not_before = now - Duration::days(1);
        params.not_after = not_after;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params
            .self_signed(&root_key)
            .map_err(|e| ProxyError::CAInit(format!("self-sign failed: {e}")))?;
        let root_cert_pem = cert.pem();

        Ok(Self {
            root_cert: cert,
            root_cert_pem,
            root_key,
            root_not_after: not_after,
            leaf_validity: Duration::days(365),
            cache: DashMap::new(),
            host_locks: DashMap::new(),
        })
    }

    fn load_from_files(cert_path: &Path, key_path: &Path, _validity_days: i64) -> ProxyResult<Self> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| ProxyError::CALoad {
            path: cert_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| ProxyError::CALoad {
            path: key_path.display().to_string(),
            reason: e.to_string(),
        })?;

        let root_key = KeyPair::from_pem(&key_pem).map_err(|e| ProxyError::CALoad {
            path: key_path.display().to_string(),
            reason: format!("invalid key: {e}"),
        })?;
        let ca_params = CertificateParams::from_ca_cert_pem(&cert_pem).map_err(|e| ProxyError::CALoad {
            path: cert_path.display().to_string(),
            reason: format!("invalid cert: {e}"),
        })?;
        let not_after = ca_params.not_after;
        let cert = ca_params
            .self_signed(&root_key)
            .map_err(|e| ProxyError::CALoad {
                path: cert_path.display().to_string(),
                reason: format!("re-sign failed: {e}"),
            })?;

        Ok(Self {
            root_cert: cert,
            root_cert_pem: cert_pem,
            root_key,
            root_not_after: not_after,
            leaf_validity: Duration::days(365),
            cache: DashMap::new(),
            host_locks: DashMap::new(),
        })
    }

    fn persist(&self, cert_path: &Path, key_path: &Path) -> ProxyResult<()> {
        if let Some(parent) = cert_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(cert_path, &self.root_cert_pem)?;
        std::fs::write(key_path, self.root_key.serialize_pem())?;
        set_key_file_mode(key_path)?;
        Ok(())
    }

    /// PEM-encoded root certificate, for writing to `-export-ca` output or
    /// handing to a browser for trust installation.
    pub fn root_cert_pem(&self) -> &str {
        &self.root_cert_pem
    }

    pub fn export_root_cert(&self, path: &Path) -> ProxyResult<()> {
        std::fs::write(path, &self.root_cert_pem)?;
        Ok(())
    }

    /// Fetch a cached leaf for `host`, minting one under a per-host lock
    /// if this is the first request for it. Concurrent requests for the
    /// same host block on the same lock rather than racing to mint.
    pub async fn leaf_for_host(&self, host: &str) -> ProxyResult<Leaf> {
        if let Some(leaf) = self.cache.get(host) {
            return Ok(leaf.clone());
        }

        let lock = self
            .host_locks
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(leaf) = self.cache.get(host) {
            return Ok(leaf.clone());
        }

        debug!(host, "minting leaf certificate");
        let leaf = self.mint_leaf(host)?;
        self.cache.insert(host.to_string(), leaf.clone());
        Ok(leaf)
    }

    fn mint_leaf(&self, host: &str) -> ProxyResult<Leaf> {
        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|e| {
            ProxyError::LeafMint {
                host: host.to_string(),
                reason: format!("key generation failed: {e}"),
            }
        })?;

        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(|e| {
            ProxyError::LeafMint {
                host: host.to_string(),
                reason: format!("invalid host name: {e}"),
            }
        })?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(host.try_into().map_err(|_| {
            ProxyError::LeafMint {
                host: host.to_string(),
                reason: "host name is not a valid DNS SAN".into(),
            }
        })?)];

        let now = OffsetDateTime::now_utc();
        let requested_not_after = now + self.leaf_validity;
        params.not_before = now - Duration::minutes(5);
        params.not_after = requested_not_after.min(self.root_not_after);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .signed_by(&leaf_key, &self.root_cert, &self.root_key)
            .map_err(|e| ProxyError::LeafMint {
                host: host.to_string(),
                reason: format!("signing failed: {e}"),
            })?;

        Ok(Leaf {
            cert_der: cert.der().to_vec(),
            key_der: leaf_key.serialize_der(),
        })
    }
}
