use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use rand::{RngCore, rngs::OsRng};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType, SerialNumber,
};
use rustls::ServerConfig;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use zeroize::Zeroizing;

const AUTHORITY_CERT_FILE: &str = "authority.crt";
const AUTHORITY_KEY_FILE: &str = "authority.pem";
const AUTHORITY_VALIDITY_YEARS: i64 = 10;
const LEAF_VALIDITY_YEARS: i64 = 10;

/// Development TLS: a self-signed CA persisted under the storage path, with
/// a fresh leaf minted for every handshake's SNI. Nothing but the CA ever
/// touches disk, so a `rm -rf` of the storage path is a full reset.
pub struct LocalTlsProvider {
    authority: Arc<LocalAuthority>,
}

struct LocalAuthority {
    cert_der: Vec<u8>,
    params: CertificateParams,
    key: KeyPair,
}

impl LocalTlsProvider {
    pub fn new<P: AsRef<Path>>(storage_path: P) -> Result<Self> {
        let authority = LocalAuthority::load_or_generate(storage_path.as_ref())?;
        Ok(Self {
            authority: Arc::new(authority),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        let resolver = LocalCertResolver {
            authority: self.authority.clone(),
        };
        let mut config = ServerConfig::builder_with_provider(ring::default_provider().into())
            .with_safe_default_protocol_versions()
            .expect("ring provider supports the default protocol versions")
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Arc::new(config)
    }
}

impl LocalAuthority {
    fn load_or_generate(storage_path: &Path) -> Result<Self> {
        let cert_path = storage_path.join(AUTHORITY_CERT_FILE);
        let key_path = storage_path.join(AUTHORITY_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            return Self::load_existing(&cert_path, &key_path);
        }

        fs::create_dir_all(storage_path).with_context(|| {
            format!("failed to create storage path {}", storage_path.display())
        })?;
        fs::set_permissions(storage_path, fs::Permissions::from_mode(0o750)).with_context(
            || format!("failed to restrict storage path {}", storage_path.display()),
        )?;

        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate authority key: {err}"))?;
        let params = build_authority_params();
        let cert = params
            .self_signed(&key)
            .map_err(|err| anyhow!("failed to self-sign authority certificate: {err}"))?;

        let key_pem = Zeroizing::new(key.serialize_pem());
        // Write-then-rename: two processes racing to create the authority
        // converge on whichever rename lands last.
        write_via_rename(storage_path, &cert_path, cert.pem().as_bytes(), 0o644)?;
        write_via_rename(storage_path, &key_path, key_pem.as_bytes(), 0o600)?;
        info!(directory = %storage_path.display(), "generated local certificate authority");

        Self::load_existing(&cert_path, &key_path)
    }

    fn load_existing(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_der = read_certificate_der(cert_path)?;
        let key_pem = Zeroizing::new(fs::read_to_string(key_path).with_context(|| {
            format!("failed to read authority key from {}", key_path.display())
        })?);
        let key = KeyPair::from_pem(key_pem.as_ref())
            .map_err(|err| anyhow!("failed to parse authority key: {err}"))?;
        ensure_key_matches_cert(&cert_der, &key)?;
        debug!(path = %cert_path.display(), "loaded local certificate authority");

        Ok(Self {
            cert_der,
            params: build_authority_params(),
            key,
        })
    }

    /// Mints a leaf for the (already IDNA-normalized) handshake name. The
    /// chain presents the leaf first with the CA behind it.
    fn mint_leaf(&self, name: &str) -> Result<CertifiedKey> {
        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![match name.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                name.try_into()
                    .map_err(|_| anyhow!("server name '{name}' is not a valid DNS name"))?,
            ),
        }];
        params.distinguished_name = distinguished_name(name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());
        set_validity(&mut params, LEAF_VALIDITY_YEARS);

        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate leaf key: {err}"))?;
        let issuer = rcgen::Issuer::from_params(&self.params, &self.key);
        let leaf_cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|err| anyhow!("failed to sign leaf certificate: {err}"))?;

        let chain = vec![
            CertificateDer::from(leaf_cert.der().as_ref().to_vec()),
            CertificateDer::from(self.cert_der.clone()),
        ];
        let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
            .map_err(|err| anyhow!("failed to serialize leaf key: {err}"))?;
        let provider = ring::default_provider();
        let certified = CertifiedKey::from_der(chain, key_der, &provider)
            .map_err(|err| anyhow!("failed to build certified key: {err}"))?;

        debug!(name, "issued local certificate");
        Ok(certified)
    }
}

struct LocalCertResolver {
    authority: Arc<LocalAuthority>,
}

impl fmt::Debug for LocalCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for LocalCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(name) = client_hello.server_name() else {
            debug!("rejecting TLS handshake without a server name");
            return None;
        };
        let ascii = match idna::domain_to_ascii(name) {
            Ok(ascii) if !ascii.is_empty() => ascii,
            _ => {
                debug!(name, "rejecting TLS handshake with invalid server name");
                return None;
            }
        };
        match self.authority.mint_leaf(&ascii) {
            Ok(certified) => Some(Arc::new(certified)),
            Err(err) => {
                debug!(name = %ascii, error = %err, "failed to mint local certificate");
                None
            }
        }
    }
}

fn build_authority_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.distinguished_name = distinguished_name("Thrust Local CA");
    set_validity(&mut params, AUTHORITY_VALIDITY_YEARS);
    params
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn
}

fn set_validity(params: &mut CertificateParams, years: i64) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(years * 365);
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 0x7F;
    if bytes.iter().all(|byte| *byte == 0) {
        bytes[bytes.len() - 1] = 1;
    }
    SerialNumber::from(bytes.to_vec())
}

fn write_via_rename(dir: &Path, target: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut suffix = [0u8; 8];
    OsRng.fill_bytes(&mut suffix);
    let temp = dir.join(format!(".tmp-{:016x}", u64::from_le_bytes(suffix)));

    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true).mode(mode);
        let mut file = options
            .open(&temp)
            .with_context(|| format!("failed to create {}", temp.display()))?;
        file.write_all(contents)
            .with_context(|| format!("failed to write {}", temp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to flush {}", temp.display()))?;
    }

    fs::rename(&temp, target)
        .with_context(|| format!("failed to move {} into place", target.display()))
}

fn read_certificate_der(path: &Path) -> Result<Vec<u8>> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read certificate {}", path.display()))?;
    let mut cursor = std::io::Cursor::new(bytes);
    let mut certs = rustls_pemfile::certs(&mut cursor);
    match certs.next() {
        Some(Ok(cert)) => Ok(cert.as_ref().to_vec()),
        Some(Err(err)) => {
            Err(err).with_context(|| format!("failed to parse certificate at {}", path.display()))
        }
        None => bail!("no certificate found in {}", path.display()),
    }
}

fn ensure_key_matches_cert(cert_der: &[u8], key: &KeyPair) -> Result<()> {
    let provider = ring::default_provider();
    let key_der = PrivateKeyDer::try_from(key.serialize_der())
        .map_err(|err| anyhow!("failed to parse authority key DER: {err}"))?;
    let cert = CertificateDer::from(cert_der.to_vec());
    CertifiedKey::from_der(vec![cert], key_der, &provider)
        .map_err(|err| anyhow!("authority key does not match certificate: {err}"))?;
    Ok(())
}
