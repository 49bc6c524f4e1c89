//! Turns resolved packages into mirror requests, one per (channel, platform) pair

use std::io::Write;
use std::path::{Path, PathBuf};

use rattler_conda_types::RepoDataRecord;

use crate::download::TransferError;
use crate::resolved::ResolvedPackages;

/// Settings shared by all mirror requests of a run
#[derive(Debug, Clone)]
pub struct MirrorOptions {
    pub target_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub num_threads: usize,
    /// In megabytes
    pub minimum_free_space: u64,
    pub max_retries: u32,
    pub show_progress: bool,
    pub dry_run: bool,
}

/// Mirrors exactly the whitelisted files of one channel platform into `target_directory`
#[derive(Debug)]
pub struct MirrorRequest<'a> {
    pub channel: &'a str,
    pub platform: &'a str,
    /// The directory of the channel, packages go into its `platform` subdirectory
    pub target_directory: PathBuf,
    pub temp_directory: PathBuf,
    pub whitelist: Vec<&'a RepoDataRecord>,
    pub num_threads: usize,
    /// In megabytes
    pub minimum_free_space: u64,
    pub max_retries: u32,
    pub show_progress: bool,
}

impl MirrorRequest<'_> {
    pub fn platform_directory(&self) -> PathBuf {
        self.target_directory.join(self.platform)
    }
}

/// What a mirror run did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MirrorReport {
    pub downloaded: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Something that can carry out a [`MirrorRequest`]. Implementations only ever write the files in
/// the whitelist and leave everything else in the target directory alone.
pub trait Mirror {
    async fn mirror(&self, request: &MirrorRequest<'_>) -> Result<MirrorReport, TransferError>;
}

/// Prints the plan and mirrors every (channel, platform) pair of `resolved`. In dry run mode only
/// the plan is printed.
pub async fn dispatch(
    mirror: &impl Mirror,
    resolved: &ResolvedPackages,
    options: &MirrorOptions,
) -> Result<Vec<MirrorReport>, TransferError> {
    write_plan(&mut std::io::stdout().lock(), resolved)
        .map_err(|e| TransferError::Io(PathBuf::from("<stdout>"), e))?;
    if options.dry_run {
        return Ok(Vec::new());
    }

    let mut reports = Vec::new();
    for (channel, platform, whitelist) in resolved.iter() {
        let request = MirrorRequest {
            channel,
            platform,
            target_directory: channel_directory(&options.target_directory, channel),
            temp_directory: options.temp_directory.clone(),
            whitelist,
            num_threads: options.num_threads,
            minimum_free_space: options.minimum_free_space,
            max_retries: options.max_retries,
            show_progress: options.show_progress,
        };

        let report = mirror.mirror(&request).await?;
        println!(
            "{channel}/{platform}: {} downloaded, {} already present",
            report.downloaded, report.skipped
        );
        reports.push(report);
    }

    Ok(reports)
}

/// Lists every file that will be mirrored, grouped by channel and platform
pub fn write_plan(out: &mut impl Write, resolved: &ResolvedPackages) -> std::io::Result<()> {
    for (channel, platform, records) in resolved.iter() {
        writeln!(out, "{channel}/{platform}")?;
        for record in records {
            writeln!(out, "\t{}", record.file_name)?;
        }
    }
    Ok(())
}

/// Channel names may contain slashes (`pkgs/main`), which become nested directories
fn channel_directory(target_directory: &Path, channel: &str) -> PathBuf {
    channel
        .split('/')
        .filter(|part| !part.is_empty() && *part != "..")
        .fold(target_directory.to_path_buf(), |path, part| path.join(part))
}
