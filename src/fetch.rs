use std::path::{Path, PathBuf};

use futures::TryStreamExt;
use rattler_conda_types::{Channel, RepoData, RepoDataRecord};
use reqwest::{Response, StatusCode, Url};
use reqwest_middleware::ClientWithMiddleware;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{event, span, Instrument, Level};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("error fetching {0}")]
    Http(Url, #[source] reqwest_middleware::Error),
    #[error("error fetching {0}: {1}")]
    Status(Url, StatusCode),
    #[error("unable to write {}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),
    #[error("invalid repodata.json from {0}")]
    Parse(Url, #[source] serde_json::Error),
    #[error("repodata parsing was aborted")]
    Aborted(#[from] tokio::task::JoinError),
}

/// Downloads `repodata.json` of the subdirectory at `platform_url` into `cache_dir` and parses it
/// into the records of `channel`
#[tracing::instrument(level = Level::DEBUG, skip(client, channel, cache_dir))]
pub async fn get_repodata(
    client: &ClientWithMiddleware,
    channel: &Channel,
    platform_url: Url,
    cache_dir: &Path,
) -> Result<Vec<RepoDataRecord>, FetchError> {
    let (repodata_url, encoding) = get_repodata_url(client, &platform_url).await;
    let response = client
        .get(repodata_url.clone())
        .send()
        .await
        .map_err(|e| FetchError::Http(repodata_url.clone(), e))?;
    if !response.status().is_success() {
        return Err(FetchError::Status(repodata_url, response.status()));
    }

    let json_path = cache_dir.join(cache_file_name(&platform_url));
    stream_and_decode_to_file(response, encoding, &json_path)
        .instrument(span!(Level::DEBUG, "download repodata.json"))
        .await
        .map_err(|e| FetchError::Io(json_path.clone(), e))?;

    let channel = channel.clone();
    tokio::task::spawn_blocking(move || {
        let bytes = std::fs::read(&json_path).map_err(|e| FetchError::Io(json_path, e))?;
        let repodata: RepoData =
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(repodata_url, e))?;
        Ok(repodata.into_repo_data_records(&channel))
    })
    .instrument(span!(Level::DEBUG, "parse repodata.json"))
    .await?
}

async fn stream_and_decode_to_file(
    response: Response,
    encoding: Option<Encoding>,
    path: &Path,
) -> std::io::Result<()> {
    let bytes = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(bytes);
    let mut file = tokio::fs::File::create(path).await?;

    match encoding {
        None => {
            tokio::io::copy(&mut reader, &mut file).await?;
        }
        Some(Encoding::Bz2) => {
            let mut decoder = async_compression::tokio::bufread::BzDecoder::new(reader);
            tokio::io::copy(&mut decoder, &mut file).await?;
        }
        Some(Encoding::Zst) => {
            let mut decoder = async_compression::tokio::bufread::ZstdDecoder::new(reader);
            tokio::io::copy(&mut decoder, &mut file).await?;
        }
    };

    file.flush().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Zst,
    Bz2,
}

/// Picks the smallest variant of `repodata.json` the server offers
#[tracing::instrument(level = Level::DEBUG, skip(client))]
async fn get_repodata_url(client: &ClientWithMiddleware, subdir_url: &Url) -> (Url, Option<Encoding>) {
    for (file_name, encoding) in [
        ("repodata.json.zst", Encoding::Zst),
        ("repodata.json.bz2", Encoding::Bz2),
    ] {
        let Ok(url) = subdir_url.join(file_name) else {
            continue;
        };
        match client.head(url.clone()).send().await {
            Ok(response) if response.status().is_success() => return (url, Some(encoding)),
            Ok(response) => {
                event!(Level::DEBUG, "{url} is not available ({})", response.status())
            }
            Err(e) => event!(Level::DEBUG, "{url} is not available: {e}"),
        }
    }

    (repodata_url(subdir_url), None)
}

fn repodata_url(subdir_url: &Url) -> Url {
    let mut url = subdir_url.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push("repodata.json");
    }
    url
}

/// A file name that is unique per subdirectory url
fn cache_file_name(platform_url: &Url) -> String {
    let sanitized: String = platform_url
        .as_str()
        .trim_end_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{sanitized}.json")
}
