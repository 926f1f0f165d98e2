/**
 * This file is part of devsandbox-proxy.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

use std::collections::HashMap;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use thiserror::Error;
use time::{Duration as TimeDuration, OffsetDateTime};

const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);
const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";

#[derive(Debug, Error)]
pub enum CaError {
    #[error("failed to create ca directory {0:?}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("failed to read {0:?}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("failed to write {0:?}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("failed to parse existing ca material: {0}")]
    Parse(String),

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("invalid host name {0:?}")]
    InvalidHost(String),
}

/// A minted leaf certificate, ready to be handed to a TLS acceptor.
#[derive(Clone)]
pub struct LeafCert {
    pub cert_der: rustls::pki_types::CertificateDer<'static>,
    pub ca_cert_der: rustls::pki_types::CertificateDer<'static>,
    pub key_der: rustls::pki_types::PrivateKeyDer<'static>,
}

/// Loads an existing CA from disk, or creates one on first run. Mints and
/// caches per-host leaf certificates signed by that CA.
///
/// Note: rcgen does not generate RSA keypairs on the fly (only ECDSA/Ed25519),
/// so both the CA and leaf keys here are ECDSA P-256 rather than the
/// 4096/2048-bit RSA keys a hand-rolled `crypto/x509` implementation would
/// use; the 10-year CA validity window and 128-bit random serial are kept
/// exactly as specified.
pub struct CertificateAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_der: rustls::pki_types::CertificateDer<'static>,
    leaf_cache: Mutex<HashMap<String, LeafCert>>,
}

impl CertificateAuthority {
    /// Load the CA material from `dir`, generating it on first use.
    pub fn load_or_create(dir: &Path) -> Result<CertificateAuthority, CaError> {
        fs::create_dir_all(dir).map_err(|e| CaError::CreateDir(dir.to_path_buf(), e))?;
        set_dir_mode(dir)?;

        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        let (ca_cert, ca_key) = if cert_path.exists() && key_path.exists() {
            Self::load(&cert_path, &key_path)?
        } else {
            let (cert, key) = Self::generate()?;
            Self::persist(&cert_path, &key_path, &cert, &key)?;
            (cert, key)
        };

        let ca_cert_der = rustls::pki_types::CertificateDer::from(ca_cert.der().to_vec());

        Ok(CertificateAuthority {
            ca_cert,
            ca_key,
            ca_cert_der,
            leaf_cache: Mutex::new(HashMap::new()),
        })
    }

    fn generate() -> Result<(rcgen::Certificate, KeyPair), CaError> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = params.not_before + TimeDuration::seconds(CA_VALIDITY.as_secs() as i64);
        params.serial_number = Some(SerialNumber::from_slice(&random_serial()));

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "devsandbox local CA");
        dn.push(DnType::OrganizationName, "devsandbox");
        params.distinguished_name = dn;

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        Ok((cert, key_pair))
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<(rcgen::Certificate, KeyPair), CaError> {
        let key_pem =
            fs::read_to_string(key_path).map_err(|e| CaError::Read(key_path.to_path_buf(), e))?;
        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;

        let cert_pem =
            fs::read_to_string(cert_path).map_err(|e| CaError::Read(cert_path.to_path_buf(), e))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| CaError::Parse(e.to_string()))?;
        let cert = params.self_signed(&key_pair)?;
        Ok((cert, key_pair))
    }

    fn persist(
        cert_path: &Path,
        key_path: &Path,
        cert: &rcgen::Certificate,
        key: &KeyPair,
    ) -> Result<(), CaError> {
        fs::write(cert_path, cert.pem()).map_err(|e| CaError::Write(cert_path.to_path_buf(), e))?;
        fs::write(key_path, key.serialize_pem())
            .map_err(|e| CaError::Write(key_path.to_path_buf(), e))?;
        set_file_mode(cert_path, 0o644)?;
        set_file_mode(key_path, 0o600)?;
        Ok(())
    }

    /// The CA's own certificate, DER-encoded, for installation into a trust
    /// store or for including in the TLS chain sent to clients.
    pub fn ca_certificate_der(&self) -> rustls::pki_types::CertificateDer<'static> {
        self.ca_cert_der.clone()
    }

    pub fn ca_certificate_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Mint (or return a cached) leaf certificate for `host`.
    pub fn leaf_for_host(&self, host: &str) -> Result<LeafCert, CaError> {
        let key = host.to_ascii_lowercase();
        if let Some(cached) = self.leaf_cache.lock().unwrap().get(&key) {
            return Ok(cached.clone());
        }

        let leaf = self.mint_leaf(&key)?;
        self.leaf_cache.lock().unwrap().insert(key, leaf.clone());
        Ok(leaf)
    }

    fn mint_leaf(&self, host: &str) -> Result<LeafCert, CaError> {
        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.not_before = OffsetDateTime::now_utc() - TimeDuration::days(1);
        params.not_after = params.not_before + TimeDuration::days(365);
        params.serial_number = Some(SerialNumber::from_slice(&random_serial()));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;

        params.subject_alt_names = vec![host_san(host)?];

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        Ok(LeafCert {
            cert_der: rustls::pki_types::CertificateDer::from(leaf_cert.der().to_vec()),
            ca_cert_der: self.ca_cert_der.clone(),
            key_der: rustls::pki_types::PrivateKeyDer::Pkcs8(
                rustls::pki_types::PrivatePkcs8KeyDer::from(leaf_key.serialize_der()),
            ),
        })
    }
}

fn host_san(host: &str) -> Result<SanType, CaError> {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Err(CaError::InvalidHost(host.to_string()));
    }
    let name = Ia5String::try_from(host).map_err(|_| CaError::InvalidHost(host.to_string()))?;
    Ok(SanType::DnsName(name))
}

fn random_serial() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f; // keep positive per X.509 DER integer encoding
    bytes
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> Result<(), CaError> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|e| CaError::Write(path.to_path_buf(), e))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> Result<(), CaError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<(), CaError> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| CaError::Write(path.to_path_buf(), e))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<(), CaError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_ca_on_first_use_and_reloads_on_second() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let pem_first = ca.ca_certificate_pem();

        let ca_again = CertificateAuthority::load_or_create(dir.path()).unwrap();
        assert_eq!(pem_first, ca_again.ca_certificate_pem());
    }

    #[test]
    fn leaf_certificates_are_cached_per_host() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let first = ca.leaf_for_host("example.com").unwrap();
        let second = ca.leaf_for_host("example.com").unwrap();
        assert_eq!(first.cert_der, second.cert_der);
    }

    #[test]
    fn different_hosts_get_different_leaves() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let a = ca.leaf_for_host("a.example.com").unwrap();
        let b = ca.leaf_for_host("b.example.com").unwrap();
        assert_ne!(a.cert_der, b.cert_der);
    }
}
