pub mod body;
pub mod codec;
pub mod forward;
pub mod headers;
pub mod http2;
pub mod pipeline;
pub mod request;
pub mod respond;
pub mod sendfile;
pub mod upstream;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cache::MemoryCache;
use crate::compress::CompressionConfig;
use crate::settings::Settings;

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix of the reserved Active Storage representation hook (§ the image
/// pipeline is intentionally unimplemented).
pub const ACTIVE_STORAGE_PREFIX: &str = "/rails/active_storage/representations/";

/// Everything a connection task needs, cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub cache: Arc<MemoryCache>,
    pub compression: CompressionConfig,
    pub upstream_addr: SocketAddr,
    pub bad_gateway_page: Option<Arc<Vec<u8>>>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>) -> Self {
        let cache = Arc::new(MemoryCache::new(
            settings.cache_size as usize,
            settings.max_cache_item_size as usize,
        ));
        let compression = CompressionConfig {
            enabled: settings.gzip_compression_enabled,
            guard_enabled: settings.gzip_compression_disable_on_auth,
            jitter: settings.gzip_compression_jitter,
        };
        let upstream_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, settings.target_port));
        let bad_gateway_page = match std::fs::read(&settings.bad_gateway_page) {
            Ok(content) => Some(Arc::new(content)),
            Err(err) => {
                debug!(
                    path = %settings.bad_gateway_page.display(),
                    error = %err,
                    "no custom 502 page found"
                );
                None
            }
        };

        Self {
            settings,
            cache,
            compression,
            upstream_addr,
            bad_gateway_page,
        }
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        UPSTREAM_CONNECT_TIMEOUT
    }
}
