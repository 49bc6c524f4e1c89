//! Downloads whitelisted package files into a channel mirror

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use md5::Md5;
use rattler_conda_types::RepoDataRecord;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{event, Level};

use crate::mirror::{Mirror, MirrorReport, MirrorRequest};

const MEGABYTE: u64 = 1024 * 1024;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("unable to write {}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),
    #[error(
        "not enough free space in {}: {} MB available, {} MB required",
        .path.display(), .available / MEGABYTE, .required / MEGABYTE
    )]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },
    #[error("failed to download {file_name} after {attempts} attempts")]
    Failed {
        file_name: String,
        attempts: u32,
        #[source]
        source: DownloadError,
    },
}

/// Why a single download attempt failed
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Http(#[from] reqwest_middleware::Error),
    #[error("server responded with {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{kind} mismatch: expected {expected}, got {actual}")]
    Mismatch {
        kind: &'static str,
        expected: String,
        actual: String,
    },
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        DownloadError::Http(e.into())
    }
}

/// Mirrors packages over HTTP. Files already present with the right size and checksum are kept,
/// everything else in the whitelist is downloaded to the temp directory, validated and moved into
/// place.
pub struct HttpMirror {
    client: ClientWithMiddleware,
}

enum FileOutcome {
    Downloaded(u64),
    Skipped,
}

impl HttpMirror {
    pub fn new(client: ClientWithMiddleware) -> HttpMirror {
        HttpMirror { client }
    }

    #[tracing::instrument(level = Level::DEBUG, skip_all, fields(file = %record.file_name))]
    async fn mirror_file(
        &self,
        request: &MirrorRequest<'_>,
        record: &RepoDataRecord,
        progress: &ProgressBar,
    ) -> Result<FileOutcome, TransferError> {
        let platform_directory = request.platform_directory();
        let destination = platform_directory.join(&record.file_name);
        let size = record.package_record.size.unwrap_or(0);

        if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
            match validate_file(destination.clone(), record.clone()).await {
                Ok(()) => {
                    event!(Level::DEBUG, "{} is up to date", destination.display());
                    progress.inc(size);
                    return Ok(FileOutcome::Skipped);
                }
                Err(e) => event!(Level::WARN, "{} is invalid, replacing it: {e}", destination.display()),
            }
        }

        // Bytes land in the temp directory first, it may live on another filesystem
        check_free_space(&request.temp_directory, size, request.minimum_free_space)?;
        check_free_space(&platform_directory, size, request.minimum_free_space)?;

        let mut attempt = 0;
        loop {
            match self.download(request, record, progress).await {
                Ok(temp) => {
                    persist(temp, &destination).await?;
                    return Ok(FileOutcome::Downloaded(size));
                }
                Err(e) if attempt < request.max_retries => {
                    let backoff = backoff(attempt);
                    attempt += 1;
                    event!(
                        Level::WARN,
                        "Download of {} failed ({e}), retry {attempt}/{} in {} ms",
                        record.file_name,
                        request.max_retries,
                        backoff.as_millis()
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(source) => {
                    return Err(TransferError::Failed {
                        file_name: record.file_name.clone(),
                        attempts: attempt + 1,
                        source,
                    })
                }
            }
        }
    }

    /// A single attempt at downloading `record` into a temporary file
    async fn download(
        &self,
        request: &MirrorRequest<'_>,
        record: &RepoDataRecord,
        progress: &ProgressBar,
    ) -> Result<mktemp::Temp, DownloadError> {
        let temp = mktemp::Temp::new_file_in(&request.temp_directory)?;
        let mut written = 0;
        let result = async {
            let response = self.client.get(record.url.clone()).send().await?;
            if !response.status().is_success() {
                return Err(DownloadError::Status(response.status()));
            }

            let mut file = tokio::fs::File::create(temp.as_path()).await?;
            let mut chunks = response.bytes_stream();
            while let Some(chunk) = chunks.try_next().await? {
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
                progress.inc(chunk.len() as u64);
            }
            file.flush().await?;
            drop(file);

            validate_file(temp.to_path_buf(), record.clone()).await
        }
        .await;

        if let Err(e) = result {
            progress.dec(written);
            return Err(e);
        }
        Ok(temp)
    }
}

impl Mirror for HttpMirror {
    async fn mirror(&self, request: &MirrorRequest<'_>) -> Result<MirrorReport, TransferError> {
        let platform_directory = request.platform_directory();
        tokio::fs::create_dir_all(&platform_directory)
            .await
            .map_err(|e| TransferError::Io(platform_directory.clone(), e))?;
        tokio::fs::create_dir_all(&request.temp_directory)
            .await
            .map_err(|e| TransferError::Io(request.temp_directory.clone(), e))?;

        let progress = progress_bar(request);
        let concurrency = match request.num_threads {
            0 => std::thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        };

        let outcomes: Vec<_> = futures::stream::iter(request.whitelist.iter())
            .map(|record| self.mirror_file(request, record, &progress))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        progress.finish_and_clear();

        let mut report = MirrorReport::default();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(FileOutcome::Downloaded(bytes)) => {
                    report.downloaded += 1;
                    report.bytes += bytes;
                }
                Ok(FileOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    event!(Level::ERROR, "{e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

fn progress_bar(request: &MirrorRequest<'_>) -> ProgressBar {
    if !request.show_progress {
        return ProgressBar::hidden();
    }

    let total = request
        .whitelist
        .iter()
        .filter_map(|record| record.package_record.size)
        .sum();
    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:40.cyan/blue}] {bytes:>8}/{total_bytes:>8} ({percent:>3}%) ETA: {eta}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    progress.set_message(format!("{}/{}", request.channel, request.platform));
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Fails if downloading `size` more bytes would leave less than `minimum_free_space` megabytes
fn check_free_space(
    directory: &Path,
    size: u64,
    minimum_free_space: u64,
) -> Result<(), TransferError> {
    let available =
        fs2::available_space(directory).map_err(|e| TransferError::Io(directory.to_path_buf(), e))?;
    let required = minimum_free_space.saturating_mul(MEGABYTE).saturating_add(size);
    if available < required {
        return Err(TransferError::InsufficientSpace {
            path: directory.to_path_buf(),
            available,
            required,
        });
    }
    Ok(())
}

/// Checks the size and checksum of the file at `path` against what the repodata says
async fn validate_file(path: PathBuf, record: RepoDataRecord) -> Result<(), DownloadError> {
    tokio::task::spawn_blocking(move || validate_file_blocking(&path, &record))
        .await
        .map_err(|e| DownloadError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn validate_file_blocking(path: &Path, record: &RepoDataRecord) -> Result<(), DownloadError> {
    let package = &record.package_record;
    if let Some(expected) = package.size {
        let actual = std::fs::metadata(path)?.len();
        if actual != expected {
            return Err(DownloadError::Mismatch {
                kind: "size",
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    if let Some(expected) = &package.sha256 {
        let actual = hash_file::<Sha256>(path)?;
        let expected = format!("{expected:x}");
        if actual != expected {
            return Err(DownloadError::Mismatch {
                kind: "sha256",
                expected,
                actual,
            });
        }
    } else if let Some(expected) = &package.md5 {
        let actual = hash_file::<Md5>(path)?;
        let expected = format!("{expected:x}");
        if actual != expected {
            return Err(DownloadError::Mismatch {
                kind: "md5",
                expected,
                actual,
            });
        }
    }

    Ok(())
}

fn hash_file<D: Digest>(path: &Path) -> std::io::Result<String>
where
    sha2::digest::Output<D>: std::fmt::LowerHex,
{
    let mut file = std::fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buffer = vec![0; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Moves a downloaded file into the mirror. The temp directory may be on another filesystem, in
/// which case the file is copied instead.
async fn persist(temp: mktemp::Temp, destination: &Path) -> Result<(), TransferError> {
    if tokio::fs::rename(temp.as_path(), destination).await.is_ok() {
        temp.release();
        return Ok(());
    }

    tokio::fs::copy(temp.as_path(), destination)
        .await
        .map_err(|e| TransferError::Io(destination.to_path_buf(), e))?;
    Ok(())
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(250)
        .saturating_mul(1 << attempt.min(8))
        .min(MAX_BACKOFF)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{serve_channel, test_client, TestPackage};

    async fn channel_records(
        server: &mut mockito::ServerGuard,
        packages: &[TestPackage],
    ) -> Vec<RepoDataRecord> {
        serve_channel(server, "channel", "linux-64", packages).await;
        let channel = rattler_conda_types::Channel::from_str(
            &format!("{}/channel", server.url()),
            &Default::default(),
        )
        .unwrap();
        let mut records = crate::fetch::get_repodata(
            &test_client(),
            &channel,
            channel.platform_url(rattler_conda_types::Platform::Linux64),
            mktemp::Temp::new_dir().unwrap().as_path(),
        )
        .await
        .unwrap();
        records.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        records
    }

    fn request<'a>(
        target: &Path,
        temp: &Path,
        whitelist: &'a [RepoDataRecord],
    ) -> MirrorRequest<'a> {
        MirrorRequest {
            channel: "channel",
            platform: "linux-64",
            target_directory: target.join("channel"),
            temp_directory: temp.to_path_buf(),
            whitelist: whitelist.iter().collect(),
            num_threads: 2,
            minimum_free_space: 0,
            max_retries: 0,
            show_progress: false,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_mirror_downloads_whitelist_only() {
        let mut server = mockito::Server::new_async().await;
        let records = channel_records(
            &mut server,
            &[
                TestPackage::new("foo", "1.0", &[], b"foo contents"),
                TestPackage::new("bar", "2.0", &[], b"bar contents"),
            ],
        )
        .await;
        let target = mktemp::Temp::new_dir().unwrap();
        let temp = mktemp::Temp::new_dir().unwrap();

        // Only foo is whitelisted
        let whitelist = &records[1..];
        let report = HttpMirror::new(test_client())
            .mirror(&request(target.as_path(), temp.as_path(), whitelist))
            .await
            .unwrap();

        assert_eq!(report.downloaded, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.bytes, b"foo contents".len() as u64);
        let platform_dir = target.as_path().join("channel/linux-64");
        assert_eq!(
            std::fs::read(platform_dir.join("foo-1.0-0.tar.bz2")).unwrap(),
            b"foo contents"
        );
        assert!(!platform_dir.join("bar-2.0-0.tar.bz2").exists());
    }

    #[test_log::test(tokio::test)]
    async fn test_existing_files_are_kept_or_replaced() {
        let mut server = mockito::Server::new_async().await;
        let records = channel_records(
            &mut server,
            &[
                TestPackage::new("foo", "1.0", &[], b"foo contents"),
                TestPackage::new("bar", "2.0", &[], b"bar contents"),
            ],
        )
        .await;
        let target = mktemp::Temp::new_dir().unwrap();
        let temp = mktemp::Temp::new_dir().unwrap();
        let platform_dir = target.as_path().join("channel/linux-64");
        std::fs::create_dir_all(&platform_dir).unwrap();

        // A valid copy of bar, a corrupt copy of foo and a file that is not part of the solve
        std::fs::write(platform_dir.join("bar-2.0-0.tar.bz2"), b"bar contents").unwrap();
        std::fs::write(platform_dir.join("foo-1.0-0.tar.bz2"), b"foo c0ntents").unwrap();
        std::fs::write(platform_dir.join("unrelated-1.0-0.conda"), b"keep me").unwrap();

        let report = HttpMirror::new(test_client())
            .mirror(&request(target.as_path(), temp.as_path(), &records))
            .await
            .unwrap();

        assert_eq!(report.downloaded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(
            std::fs::read(platform_dir.join("foo-1.0-0.tar.bz2")).unwrap(),
            b"foo contents"
        );
        assert_eq!(
            std::fs::read(platform_dir.join("unrelated-1.0-0.conda")).unwrap(),
            b"keep me"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_checksum_mismatch_is_retried_then_reported() {
        let mut server = mockito::Server::new_async().await;
        let mut package = TestPackage::new("foo", "1.0", &[], b"foo contents");
        // The server hands out different bytes of the same length than the repodata describes
        package.served = b"bad contents".to_vec();
        let records = channel_records(&mut server, &[package]).await;
        let target = mktemp::Temp::new_dir().unwrap();
        let temp = mktemp::Temp::new_dir().unwrap();

        let mut request = request(target.as_path(), temp.as_path(), &records);
        request.max_retries = 1;
        let error = HttpMirror::new(test_client())
            .mirror(&request)
            .await
            .unwrap_err();

        let TransferError::Failed {
            file_name,
            attempts,
            source,
        } = error
        else {
            panic!("expected a failed transfer, got {error:?}");
        };
        assert_eq!(file_name, "foo-1.0-0.tar.bz2");
        assert_eq!(attempts, 2);
        assert!(matches!(source, DownloadError::Mismatch { kind: "sha256", .. }));
        assert!(!target
            .as_path()
            .join("channel/linux-64/foo-1.0-0.tar.bz2")
            .exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let mut package = TestPackage::new("foo", "1.0", &[], b"foo contents");
        package.status = 404;
        let records = channel_records(&mut server, &[package]).await;
        let target = mktemp::Temp::new_dir().unwrap();
        let temp = mktemp::Temp::new_dir().unwrap();

        let error = HttpMirror::new(test_client())
            .mirror(&request(target.as_path(), temp.as_path(), &records))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            TransferError::Failed {
                source: DownloadError::Status(StatusCode::NOT_FOUND),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_insufficient_free_space() {
        let mut server = mockito::Server::new_async().await;
        let records = channel_records(
            &mut server,
            &[TestPackage::new("foo", "1.0", &[], b"foo contents")],
        )
        .await;
        let target = mktemp::Temp::new_dir().unwrap();
        let temp = mktemp::Temp::new_dir().unwrap();

        let mut request = request(target.as_path(), temp.as_path(), &records);
        request.minimum_free_space = u64::MAX / MEGABYTE;
        let error = HttpMirror::new(test_client())
            .mirror(&request)
            .await
            .unwrap_err();

        let TransferError::InsufficientSpace { path, .. } = error else {
            panic!("expected an insufficient space error, got {error:?}");
        };
        assert_eq!(path, temp.as_path());
    }

    #[test]
    fn test_free_space_of_missing_directory() {
        let temp = mktemp::Temp::new_dir().unwrap();
        let missing = temp.as_path().join("missing");

        assert!(matches!(
            check_free_space(&missing, 0, 0),
            Err(TransferError::Io(path, _)) if path == missing
        ));
        assert!(check_free_space(temp.as_path(), 0, 0).is_ok());
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(0), Duration::from_millis(250));
        assert_eq!(backoff(2), Duration::from_secs(1));
        assert_eq!(backoff(7), MAX_BACKOFF);
        assert_eq!(backoff(100), MAX_BACKOFF);
    }
}
