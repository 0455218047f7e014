#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod cert;
pub mod crypto;
pub mod io;
pub mod tls;

use once_cell::sync::Lazy;
use p12_keystore::{KeyStore, KeyStoreEntry, PrivateKeyChain};
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256,
};
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tracing::{debug, trace, warn};

use crate::crypto::init_crypto;

static SNITCHER_CA_CN: &str = "Snitcher CA";
static SNITCHER_ORG: &str = "snitcher";
static KEYSTORE_ALIAS: &str = "snitcher-ca";

// Serializes get_or_create so that at most one caller generates and writes
// the container; everyone else loads what the winner persisted.
static CA_INIT: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Debug)]
pub enum CaError {
    Io(std::io::Error),
    RcGen(rcgen::Error),
    KeyStore(p12_keystore::error::Error),
    KeyParse,
    EmptyContainer,
    Lock,
    TrustStore(String),
}

impl Error for CaError {}

impl std::fmt::Display for CaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<std::io::Error> for CaError {
    fn from(value: std::io::Error) -> Self {
        CaError::Io(value)
    }
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        CaError::RcGen(value)
    }
}

impl From<p12_keystore::error::Error> for CaError {
    fn from(value: p12_keystore::error::Error) -> Self {
        CaError::KeyStore(value)
    }
}

/// The proxy's signing identity: a self-signed root plus the per-hostname
/// leaf cache. Cloning is cheap; all clones share the cache.
#[derive(Debug, Clone)]
pub struct SnitcherCA {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    issuer: Issuer<'static, KeyPair>,
    ca_der: CertificateDer<'static>,
    cert_pem_path: PathBuf,
    leaves: Mutex<HashMap<String, LeafEntry>>,
}

#[derive(Debug)]
struct LeafEntry {
    cert_der: CertificateDer<'static>,
    key_der: PrivateKeyDer<'static>,
}

impl SnitcherCA {
    /// Loads the CA from the PKCS#12 container at `path`, generating and
    /// persisting a fresh one when the file does not exist. Idempotent under
    /// concurrent callers: one generator wins, the rest observe its output.
    pub fn get_or_create(path: &Path, passphrase: &str) -> Result<SnitcherCA, CaError> {
        init_crypto();
        let _guard = CA_INIT.lock().map_err(|_| CaError::Lock)?;

        let (issuer, ca_der) = if path.exists() {
            trace!("Loading CA container from {}", path.display());
            load_container(path, passphrase)?
        } else {
            generate_container(path, passphrase)?
        };

        Ok(SnitcherCA {
            inner: Arc::new(Inner {
                issuer,
                ca_der,
                cert_pem_path: cert_pem_path(path),
                leaves: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Returns the cached leaf for `host`, minting one when absent. The mint
    /// happens under the cache mutex, so concurrent callers for the same
    /// hostname get exactly one certificate.
    pub fn sign_leaf(
        &self,
        host: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>), CaError> {
        let host = host.to_ascii_lowercase();
        let mut leaves = self.inner.leaves.lock().map_err(|_| CaError::Lock)?;

        if let Some(entry) = leaves.get(&host) {
            trace!("Leaf cache hit for {host}");
            return Ok((entry.cert_der.clone(), entry.key_der.clone_key()));
        }

        debug!("Minting leaf certificate for {host}");
        let mut params = CertificateParams::new(vec![host.clone()])?;
        params
            .distinguished_name
            .push(DnType::CommonName, host.as_str());
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = OffsetDateTime::now_utc().saturating_sub(Duration::days(1));
        params.not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(365));

        let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
        let leaf = params.signed_by(&key_pair, &self.inner.issuer)?;
        let key_der =
            PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|_| CaError::KeyParse)?;

        let cert_der = leaf.der().clone();
        leaves.insert(
            host,
            LeafEntry {
                cert_der: cert_der.clone(),
                key_der: key_der.clone_key(),
            },
        );

        Ok((cert_der, key_der))
    }

    pub fn ca_der(&self) -> &CertificateDer<'static> {
        &self.inner.ca_der
    }

    /// Root store containing the platform trust anchors plus this CA, for
    /// clients that want to trust intercepted connections.
    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();

        let native = rustls_native_certs::load_native_certs();
        for err in native.errors.iter() {
            warn!("Load cert error {err}");
        }
        for cert in native.certs {
            if let Err(err) = roots.add(cert) {
                warn!("failed to parse trust anchor: {err}");
            }
        }
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Err(err) = roots.add(self.inner.ca_der.clone()) {
            warn!("failed to add snitcher CA to root store: {err}");
        }
        roots
    }

    /// Advisory import of the CA certificate into the user trust store. The
    /// proxy works without it, but clients reject intercepted TLS until the
    /// CA is trusted.
    pub fn install_trust(&self) -> Result<(), CaError> {
        let pem = &self.inner.cert_pem_path;
        if !pem.exists() {
            return Err(CaError::TrustStore(format!(
                "CA certificate not found at {}",
                pem.display()
            )));
        }
        install_trust_platform(pem)
    }
}

#[cfg(target_os = "macos")]
fn install_trust_platform(pem: &Path) -> Result<(), CaError> {
    let keychain = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Library/Keychains/login.keychain-db");
    let status = std::process::Command::new("security")
        .args(["add-trusted-cert", "-r", "trustRoot", "-k"])
        .arg(keychain)
        .arg(pem)
        .status();
    check_import_status(status)
}

#[cfg(target_os = "windows")]
fn install_trust_platform(pem: &Path) -> Result<(), CaError> {
    let status = std::process::Command::new("certutil")
        .args(["-user", "-addstore", "Root"])
        .arg(pem)
        .status();
    check_import_status(status)
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn install_trust_platform(pem: &Path) -> Result<(), CaError> {
    debug!(
        "No per-user trust store on this platform; import {} manually \
         (copy to /usr/local/share/ca-certificates and run \
         update-ca-certificates)",
        pem.display()
    );
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn check_import_status(
    status: Result<std::process::ExitStatus, std::io::Error>,
) -> Result<(), CaError> {
    match status {
        Ok(code) if code.success() => Ok(()),
        Ok(code) => Err(CaError::TrustStore(format!(
            "trust store import exited with {code}"
        ))),
        Err(err) => Err(CaError::TrustStore(format!(
            "trust store import failed to run: {err}"
        ))),
    }
}

fn cert_pem_path(container: &Path) -> PathBuf {
    container.with_extension("pem")
}

fn load_container(
    path: &Path,
    passphrase: &str,
) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>), CaError> {
    let data = fs::read(path)?;
    let keystore = KeyStore::from_pkcs12(&data, passphrase)?;

    let (key_der, cert_der) = keystore
        .entries()
        .find_map(|(_, entry)| match entry {
            KeyStoreEntry::PrivateKeyChain(chain) => chain
                .chain()
                .first()
                .map(|cert| (chain.key().to_vec(), cert.as_der().to_vec())),
            _ => None,
        })
        .ok_or(CaError::EmptyContainer)?;

    let key_pair = KeyPair::try_from(key_der.as_slice()).map_err(|_| CaError::KeyParse)?;
    let ca_der = CertificateDer::from(cert_der);
    let issuer = Issuer::from_ca_cert_der(&ca_der, key_pair)?;

    trace!(
        "CA loaded; install {} into your browser or system trust store",
        cert_pem_path(path).display()
    );
    Ok((issuer, ca_der))
}

fn generate_container(
    path: &Path,
    passphrase: &str,
) -> Result<(Issuer<'static, KeyPair>, CertificateDer<'static>), CaError> {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    ca_params.distinguished_name = DistinguishedName::new();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, SNITCHER_CA_CN);
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, SNITCHER_ORG);

    ca_params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.key_usages.push(KeyUsagePurpose::CrlSign);

    ca_params.not_before = OffsetDateTime::now_utc();
    ca_params.not_after = OffsetDateTime::now_utc().saturating_add(Duration::days(365 * 10));

    let key_pair = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
    let ca_cert = ca_params.self_signed(&key_pair)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut key_store = KeyStore::new();
    let certificate = p12_keystore::Certificate::from_der(ca_cert.der())?;

    let mut local_key_id = vec![0u8; 20];
    rand::rng().fill_bytes(&mut local_key_id);

    let key_chain =
        PrivateKeyChain::new(key_pair.serialized_der(), local_key_id, vec![certificate]);
    key_store.add_entry(KEYSTORE_ALIAS, KeyStoreEntry::PrivateKeyChain(key_chain));

    let writer = key_store.writer(passphrase);
    fs::write(path, writer.write()?)?;

    // The cert alone as PEM next to the container, for trust-store imports.
    fs::write(cert_pem_path(path), ca_cert.pem())?;

    debug!("Snitcher root CA generated:");
    debug!("Container path {}", path.display());
    debug!("Cert path {}", cert_pem_path(path).display());
    debug!("Import the .pem cert into your browser/system as a trusted root CA.");

    let ca_der = ca_cert.der().clone();
    Ok((Issuer::new(ca_params, key_pair), ca_der))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_load_yields_same_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snitcher-ca.p12");

        let generated = SnitcherCA::get_or_create(&path, "sekrit").unwrap();
        assert!(path.exists());
        assert!(cert_pem_path(&path).exists());

        let loaded = SnitcherCA::get_or_create(&path, "sekrit").unwrap();
        assert_eq!(generated.ca_der(), loaded.ca_der());
    }

    #[test]
    fn leaf_is_minted_at_most_once_per_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snitcher-ca.p12");
        let ca = SnitcherCA::get_or_create(&path, "sekrit").unwrap();

        let (first, _) = ca.sign_leaf("Example.Test").unwrap();
        let (second, _) = ca.sign_leaf("example.test").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn concurrent_minting_converges_on_one_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snitcher-ca.p12");
        let ca = SnitcherCA::get_or_create(&path, "sekrit").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ca = ca.clone();
                std::thread::spawn(move || ca.sign_leaf("race.test").unwrap().0)
            })
            .collect();

        let mut certs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        certs.dedup();
        assert_eq!(certs.len(), 1);
    }
}
