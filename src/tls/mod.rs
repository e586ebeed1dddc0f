pub mod acme;
pub mod local;

use std::sync::Arc;

use anyhow::Result;
use rustls::ServerConfig;

use crate::settings::Settings;

/// Certificate source for the HTTPS listener: ACME-issued production
/// certificates, or a locally-rooted development CA.
pub enum TlsProvider {
    Acme(acme::AcmeProvider),
    Local(local::LocalTlsProvider),
}

impl TlsProvider {
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        if settings.tls_local {
            Ok(TlsProvider::Local(local::LocalTlsProvider::new(
                &settings.storage_path,
            )?))
        } else {
            Ok(TlsProvider::Acme(acme::AcmeProvider::new(settings)?))
        }
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        match self {
            TlsProvider::Acme(provider) => provider.server_config(),
            TlsProvider::Local(provider) => provider.server_config(),
        }
    }

    /// Answers ACME HTTP-01 challenges on the cleartext listener. `None`
    /// means the path is not a (known) challenge and should be redirected.
    pub fn challenge_response(&self, path: &str) -> Option<Vec<u8>> {
        match self {
            TlsProvider::Acme(provider) => provider.challenge_response(path),
            TlsProvider::Local(_) => None,
        }
    }

    /// Starts background issuance/renewal where the provider needs it.
    pub fn start(&self) {
        if let TlsProvider::Acme(provider) = self {
            provider.spawn_issuance();
        }
    }
}
