use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, ExternalAccountKey,
    Identifier, NewAccount, NewOrder, Order, OrderStatus,
};
use parking_lot::{Mutex, RwLock};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::ServerConfig;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::settings::Settings;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";
const ACME_TLS_ALPN: &[u8] = b"acme-tls/1";
const ACCOUNT_FILE: &str = "acme-account.json";
/// Certificates older than this are reissued (well inside the usual 90-day
/// ACME validity).
const RENEW_AFTER: Duration = Duration::from_secs(60 * 24 * 60 * 60);
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const RENEWAL_RETRY_INTERVAL: Duration = Duration::from_secs(60 * 60);
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(1);
const ORDER_POLL_ATTEMPTS: usize = 60;

/// Automated certificates: ACME issuance against the configured directory,
/// an exact-match hostname allowlist, and an on-disk cache of one PEM
/// bundle per hostname under the storage path.
pub struct AcmeProvider {
    shared: Arc<AcmeShared>,
}

struct AcmeShared {
    domains: Vec<String>,
    directory_url: String,
    storage_path: PathBuf,
    eab: Option<EabCredentials>,
    certificates: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    http_challenges: Mutex<HashMap<String, String>>,
    alpn_challenges: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

struct EabCredentials {
    kid: String,
    hmac_key: Zeroizing<Vec<u8>>,
}

impl AcmeProvider {
    pub fn new(settings: &Settings) -> Result<Self> {
        let domains: Vec<String> = settings
            .tls_domains()
            .into_iter()
            .map(|domain| domain.to_ascii_lowercase())
            .collect();
        anyhow::ensure!(!domains.is_empty(), "TLS requires at least one domain");

        let eab = parse_eab(&settings.eab_kid, &settings.eab_hmac_key)?;
        fs::create_dir_all(&settings.storage_path).with_context(|| {
            format!(
                "failed to create storage path {}",
                settings.storage_path.display()
            )
        })?;

        debug!(
            directory = %settings.acme_directory,
            using_eab = eab.is_some(),
            "initializing automated TLS"
        );

        Ok(Self {
            shared: Arc::new(AcmeShared {
                domains,
                directory_url: settings.acme_directory.clone(),
                storage_path: settings.storage_path.clone(),
                eab,
                certificates: RwLock::new(HashMap::new()),
                http_challenges: Mutex::new(HashMap::new()),
                alpn_challenges: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        let resolver = AcmeCertResolver {
            shared: self.shared.clone(),
        };
        let mut config = ServerConfig::builder_with_provider(ring::default_provider().into())
            .with_safe_default_protocol_versions()
            .expect("ring provider supports the default protocol versions")
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = vec![
            b"h2".to_vec(),
            b"http/1.1".to_vec(),
            ACME_TLS_ALPN.to_vec(),
        ];
        Arc::new(config)
    }

    /// HTTP-01 terminator for the cleartext listener.
    pub fn challenge_response(&self, path: &str) -> Option<Vec<u8>> {
        let token = path.strip_prefix(ACME_CHALLENGE_PREFIX)?;
        self.shared
            .http_challenges
            .lock()
            .get(token)
            .map(|key_auth| key_auth.clone().into_bytes())
    }

    /// Issues (and later renews) certificates on a background task so that
    /// handshakes stay synchronous.
    pub fn spawn_issuance(&self) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                let mut all_ok = true;
                for domain in shared.domains.clone() {
                    if let Err(err) = shared.ensure_certificate(&domain).await {
                        all_ok = false;
                        warn!(domain, error = %err, "certificate issuance failed");
                    }
                }
                let delay = if all_ok {
                    RENEWAL_CHECK_INTERVAL
                } else {
                    RENEWAL_RETRY_INTERVAL
                };
                tokio::time::sleep(delay).await;
            }
        });
    }
}

impl AcmeShared {
    async fn ensure_certificate(&self, domain: &str) -> Result<()> {
        let bundle_path = self.bundle_path(domain);
        let needs_issue = match fs::metadata(&bundle_path) {
            Ok(metadata) => {
                let age = metadata
                    .modified()
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .unwrap_or(Duration::MAX);
                age > RENEW_AFTER
            }
            Err(_) => true,
        };

        if !needs_issue {
            if !self.certificates.read().contains_key(domain) {
                match load_bundle(&bundle_path) {
                    Ok(certified) => {
                        info!(domain, "loaded certificate from cache");
                        self.certificates
                            .write()
                            .insert(domain.to_string(), Arc::new(certified));
                    }
                    Err(err) => {
                        warn!(domain, error = %err, "cached certificate unusable; reissuing");
                        return self.issue(domain).await;
                    }
                }
            }
            return Ok(());
        }

        self.issue(domain).await
    }

    async fn issue(&self, domain: &str) -> Result<()> {
        info!(domain, "requesting certificate");
        let account = self.account().await?;
        let identifier = Identifier::Dns(domain.to_string());
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await
            .context("failed to create ACME order")?;

        let authorizations = order
            .authorizations()
            .await
            .context("failed to fetch ACME authorizations")?;
        let mut cleanup_tokens = Vec::new();

        for authorization in &authorizations {
            match authorization.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => bail!("unexpected authorization status {status:?}"),
            }

            // HTTP-01 first: the cleartext listener is always present.
            // TLS-ALPN-01 covers directories that do not offer it.
            if let Some(challenge) = authorization
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::Http01)
            {
                let key_auth = order.key_authorization(challenge);
                self.http_challenges
                    .lock()
                    .insert(challenge.token.clone(), key_auth.as_str().to_string());
                cleanup_tokens.push(challenge.token.clone());
                order
                    .set_challenge_ready(&challenge.url)
                    .await
                    .context("failed to mark HTTP-01 challenge ready")?;
            } else if let Some(challenge) = authorization
                .challenges
                .iter()
                .find(|challenge| challenge.r#type == ChallengeType::TlsAlpn01)
            {
                let key_auth = order.key_authorization(challenge);
                let digest = Sha256::digest(key_auth.as_str().as_bytes());
                let certified = challenge_certificate(domain, &digest)?;
                self.alpn_challenges
                    .write()
                    .insert(domain.to_string(), Arc::new(certified));
                order
                    .set_challenge_ready(&challenge.url)
                    .await
                    .context("failed to mark TLS-ALPN-01 challenge ready")?;
            } else {
                bail!("ACME directory offered no supported challenge for {domain}");
            }
        }

        let result = self.finalize_order(domain, &mut order).await;

        let mut http_challenges = self.http_challenges.lock();
        for token in cleanup_tokens {
            http_challenges.remove(&token);
        }
        drop(http_challenges);
        self.alpn_challenges.write().remove(domain);

        result
    }

    async fn finalize_order(&self, domain: &str, order: &mut Order) -> Result<()> {
        let mut attempts = 0;
        loop {
            let state = order.refresh().await.context("failed to poll ACME order")?;
            match state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => bail!("ACME order for {domain} became invalid"),
                OrderStatus::Valid => break,
                _ => {
                    attempts += 1;
                    if attempts > ORDER_POLL_ATTEMPTS {
                        bail!("timed out waiting for ACME order to become ready");
                    }
                    tokio::time::sleep(ORDER_POLL_INTERVAL).await;
                }
            }
        }

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|err| anyhow!("invalid certificate subject '{domain}': {err}"))?;
        params.distinguished_name = DistinguishedName::new();
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate certificate key: {err}"))?;
        let csr = params
            .serialize_request(&key)
            .map_err(|err| anyhow!("failed to build CSR: {err}"))?;

        order
            .finalize(csr.der().as_ref())
            .await
            .context("failed to finalize ACME order")?;

        let chain_pem = {
            let mut attempts = 0;
            loop {
                match order
                    .certificate()
                    .await
                    .context("failed to download certificate")?
                {
                    Some(chain) => break chain,
                    None => {
                        attempts += 1;
                        if attempts > ORDER_POLL_ATTEMPTS {
                            bail!("timed out waiting for the certificate to be issued");
                        }
                        tokio::time::sleep(ORDER_POLL_INTERVAL).await;
                    }
                }
            }
        };

        let key_pem = Zeroizing::new(key.serialize_pem());
        let bundle = format!("{}\n{chain_pem}", key_pem.as_str());
        let bundle_path = self.bundle_path(domain);
        write_private(&bundle_path, bundle.as_bytes())?;

        let certified = load_bundle(&bundle_path)?;
        self.certificates
            .write()
            .insert(domain.to_string(), Arc::new(certified));
        info!(domain, "certificate issued");
        Ok(())
    }

    async fn account(&self) -> Result<Account> {
        let account_path = self.storage_path.join(ACCOUNT_FILE);
        if let Ok(raw) = fs::read(&account_path) {
            let credentials: AccountCredentials =
                serde_json::from_slice(&raw).context("failed to parse cached ACME account")?;
            return Account::from_credentials(credentials)
                .await
                .context("failed to restore ACME account");
        }

        let eab = self
            .eab
            .as_ref()
            .map(|eab| ExternalAccountKey::new(eab.kid.clone(), &eab.hmac_key));
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            eab.as_ref(),
        )
        .await
        .context("failed to create ACME account")?;

        let serialized =
            serde_json::to_vec(&credentials).context("failed to serialize ACME account")?;
        write_private(&account_path, &serialized)?;
        Ok(account)
    }

    fn bundle_path(&self, domain: &str) -> PathBuf {
        self.storage_path.join(domain)
    }

    fn is_allowed(&self, domain: &str) -> bool {
        self.domains.iter().any(|allowed| allowed == domain)
    }
}

struct AcmeCertResolver {
    shared: Arc<AcmeShared>,
}

impl fmt::Debug for AcmeCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for AcmeCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_ascii_lowercase();
        if !self.shared.is_allowed(&name) {
            debug!(name, "rejecting TLS handshake for unlisted host");
            return None;
        }

        let is_challenge = client_hello
            .alpn()
            .map(|mut protocols| protocols.any(|protocol| protocol == ACME_TLS_ALPN))
            .unwrap_or(false);
        if is_challenge {
            return self.shared.alpn_challenges.read().get(&name).cloned();
        }

        self.shared.certificates.read().get(&name).cloned()
    }
}

fn parse_eab(kid: &str, hmac_key: &str) -> Result<Option<EabCredentials>> {
    if kid.is_empty() || hmac_key.is_empty() {
        return Ok(None);
    }
    let decoded = URL_SAFE_NO_PAD
        .decode(hmac_key)
        .context("EAB_HMAC_KEY is not valid base64url")?;
    Ok(Some(EabCredentials {
        kid: kid.to_string(),
        hmac_key: Zeroizing::new(decoded),
    }))
}

/// Self-signed certificate carrying the ACME identifier extension, served
/// only to `acme-tls/1` handshakes during validation.
fn challenge_certificate(domain: &str, digest: &[u8]) -> Result<CertifiedKey> {
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|err| anyhow!("invalid challenge subject '{domain}': {err}"))?;
    params.distinguished_name = DistinguishedName::new();
    params.custom_extensions = vec![CustomExtension::new_acme_identifier(digest)];
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|err| anyhow!("failed to generate challenge key: {err}"))?;
    let cert = params
        .self_signed(&key)
        .map_err(|err| anyhow!("failed to self-sign challenge certificate: {err}"))?;

    let chain = vec![CertificateDer::from(cert.der().as_ref().to_vec())];
    let key_der = PrivateKeyDer::try_from(key.serialize_der())
        .map_err(|err| anyhow!("failed to serialize challenge key: {err}"))?;
    let provider = ring::default_provider();
    CertifiedKey::from_der(chain, key_der, &provider)
        .map_err(|err| anyhow!("failed to build challenge key: {err}"))
}

fn load_bundle(path: &Path) -> Result<CertifiedKey> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read certificate bundle {}", path.display()))?;

    let key_der = rustls_pemfile::private_key(&mut raw.as_slice())
        .with_context(|| format!("failed to parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))?;

    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut raw.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))?;
    anyhow::ensure!(
        !chain.is_empty(),
        "no certificates found in {}",
        path.display()
    );

    let provider = ring::default_provider();
    CertifiedKey::from_der(chain, key_der, &provider)
        .map_err(|err| anyhow!("certificate bundle {} is unusable: {err}", path.display()))
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::test_settings;
    use tempfile::TempDir;

    fn provider_for(dir: &TempDir, domains: &str) -> AcmeProvider {
        let mut settings = test_settings();
        settings.tls_domain = domains.to_string();
        settings.storage_path = dir.path().to_path_buf();
        AcmeProvider::new(&settings).unwrap()
    }

    #[test]
    fn requires_at_least_one_domain() {
        let dir = TempDir::new().unwrap();
        let mut settings = test_settings();
        settings.storage_path = dir.path().to_path_buf();
        assert!(AcmeProvider::new(&settings).is_err());
    }

    #[test]
    fn eab_requires_both_fields() {
        assert!(parse_eab("", "").unwrap().is_none());
        assert!(parse_eab("kid", "").unwrap().is_none());
        assert!(parse_eab("", "aGVsbG8").unwrap().is_none());

        let eab = parse_eab("kid-1", "aGVsbG8").unwrap().unwrap();
        assert_eq!(eab.kid, "kid-1");
        assert_eq!(eab.hmac_key.as_slice(), b"hello");
    }

    #[test]
    fn eab_rejects_invalid_base64() {
        assert!(parse_eab("kid", "!!!not-base64!!!").is_err());
    }

    #[test]
    fn challenge_responses_only_for_known_tokens() {
        let dir = TempDir::new().unwrap();
        let provider = provider_for(&dir, "example.com");

        assert!(provider.challenge_response("/anything").is_none());
        assert!(
            provider
                .challenge_response("/.well-known/acme-challenge/missing")
                .is_none()
        );

        provider
            .shared
            .http_challenges
            .lock()
            .insert("tok".to_string(), "tok.auth".to_string());
        assert_eq!(
            provider
                .challenge_response("/.well-known/acme-challenge/tok")
                .as_deref(),
            Some(&b"tok.auth"[..])
        );
    }

    #[test]
    fn allowlist_is_exact_match() {
        let dir = TempDir::new().unwrap();
        let provider = provider_for(&dir, "example.com, www.example.com");
        assert!(provider.shared.is_allowed("example.com"));
        assert!(provider.shared.is_allowed("www.example.com"));
        assert!(!provider.shared.is_allowed("sub.example.com"));
        assert!(!provider.shared.is_allowed("other.test"));
    }

    #[test]
    fn challenge_certificate_is_self_contained() {
        let digest = Sha256::digest(b"key-auth");
        let certified = challenge_certificate("example.com", &digest).unwrap();
        assert_eq!(certified.cert.len(), 1);
    }

    #[test]
    fn bundle_round_trips_through_disk() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("example.com");

        let mut params = CertificateParams::new(vec!["example.com".to_string()])
            .map_err(|err| anyhow!("{err}"))?;
        params.distinguished_name = DistinguishedName::new();
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("{err}"))?;
        let cert = params.self_signed(&key).map_err(|err| anyhow!("{err}"))?;
        let bundle = format!("{}\n{}", key.serialize_pem(), cert.pem());
        write_private(&path, bundle.as_bytes())?;

        let certified = load_bundle(&path)?;
        assert_eq!(certified.cert.len(), 1);
        Ok(())
    }
}
