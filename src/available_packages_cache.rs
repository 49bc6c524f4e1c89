use std::path::PathBuf;
use std::sync::Arc;

use rattler_conda_types::{Platform, RepoDataRecord};
use reqwest::{StatusCode, Url};
use reqwest_middleware::ClientWithMiddleware;
use tracing::{event, Level};

use crate::channel::MirrorChannel;
use crate::fetch::FetchError;
use crate::generic_cache::{GenericCache, GetCachedResult};

/// Caches the available packages for (channel, platform) pairs. Every platform solve needs the
/// `noarch` packages of every channel, so these are downloaded once per run.
pub struct AvailablePackagesCache {
    cache: GenericCache<Url, Vec<RepoDataRecord>>,
    download_client: ClientWithMiddleware,
    cache_dir: PathBuf,
}

impl AvailablePackagesCache {
    /// Creates an empty `AvailablePackagesCache` that keeps downloaded repodata in `cache_dir`
    pub fn new(download_client: ClientWithMiddleware, cache_dir: PathBuf) -> AvailablePackagesCache {
        AvailablePackagesCache {
            cache: GenericCache::new(),
            download_client,
            cache_dir,
        }
    }

    /// Gets the records for this channel and platform if they exist in the cache, and downloads
    /// them otherwise. A channel without a subdirectory for `platform` has no packages for it, only
    /// a missing `noarch` is an error.
    pub async fn get(
        &self,
        channel: &MirrorChannel,
        platform: Platform,
    ) -> Result<Arc<Vec<RepoDataRecord>>, FetchError> {
        let platform_url = channel.channel.platform_url(platform);
        let write_guard = match self.cache.get_cached(&platform_url).await {
            GetCachedResult::Found(records) => return Ok(records),
            GetCachedResult::NotFound(write_guard) => write_guard,
        };

        event!(Level::INFO, "Fetching repodata for {}/{platform}", channel.name);
        let download_start = std::time::Instant::now();
        let records = match crate::fetch::get_repodata(
            &self.download_client,
            &channel.channel,
            platform_url.clone(),
            &self.cache_dir,
        )
        .await
        {
            Ok(records) => records,
            Err(FetchError::Status(url, StatusCode::NOT_FOUND)) if platform != Platform::NoArch => {
                event!(
                    Level::WARN,
                    "{} has no {platform} subdirectory ({url} not found), skipping it",
                    channel.name
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        event!(
            Level::INFO,
            "Downloaded and parsed {} records of {}/{platform} in {} ms",
            records.len(),
            channel.name,
            download_start.elapsed().as_millis()
        );

        let records = Arc::new(records);
        self.cache.set(platform_url, records.clone(), write_guard);

        Ok(records)
    }
}
