mod available_packages_cache;
mod channel;
mod cli;
mod download;
mod environment;
mod error;
mod fetch;
mod generic_cache;
mod mirror;
mod resolved;
mod solver;
#[cfg(test)]
mod test_support;
mod virtual_packages;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rattler_conda_types::{MatchSpec, Platform};
use rattler_networking::{AuthenticationMiddleware, AuthenticationStorage};
use reqwest_middleware::ClientWithMiddleware;
use tracing::level_filters::LevelFilter;
use tracing::{event, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::available_packages_cache::AvailablePackagesCache;
use crate::channel::channel_set;
use crate::cli::Args;
use crate::download::HttpMirror;
use crate::environment::{parse_environment_file, EnvironmentFile};
use crate::error::{ConfigError, DownloaderError, InputError};
use crate::mirror::{dispatch, MirrorOptions};
use crate::solver::{select_backend, Resolver};
use crate::virtual_packages::parse_virtual_package;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level());

    run(args, download_client()).await?;

    Ok(())
}

fn init_tracing(level: Level) {
    // RUST_LOG takes precedence over the verbosity flags
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true))
        .init();
}

/// The client used for repodata and package downloads, picking up stored channel credentials
pub fn download_client() -> ClientWithMiddleware {
    reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
        .with_arc(Arc::new(AuthenticationMiddleware::new(
            AuthenticationStorage::default(),
        )))
        .build()
}

/// Resolves and mirrors the requested packages, one platform after the other
async fn run(args: Args, client: ClientWithMiddleware) -> Result<(), DownloaderError> {
    event!(Level::DEBUG, "{args:?}");

    let platforms = parse_platforms(&args.platforms)?;
    let environment = match &args.file {
        Some(path) => parse_environment_file(path).map_err(InputError::from)?,
        None => EnvironmentFile::default(),
    };

    let channels = channel_set(
        args.channels
            .iter()
            .chain(&environment.channels)
            .map(String::as_str),
        &platforms,
    )
    .map_err(ConfigError::from)?;
    let specs = parse_specs(args.packages.iter().chain(&environment.specs))?;
    let virtual_packages = args
        .virtual_packages
        .iter()
        .map(|spec| parse_virtual_package(spec))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ConfigError::from)?;
    let backend = select_backend(args.solver)?;

    // Repodata is only needed for this run, it goes away with `cache_dir`
    let cache_dir = std::fs::create_dir_all(&args.temp_directory)
        .and_then(|_| mktemp::Temp::new_dir_in(&args.temp_directory))
        .map_err(|e| ConfigError::TempDirectory(args.temp_directory.clone(), e))?;

    let resolver = Resolver::new(
        backend,
        AvailablePackagesCache::new(client.clone(), cache_dir.to_path_buf()),
        virtual_packages,
        args.solve_timeout.map(Duration::from_secs),
    );
    let mirror = HttpMirror::new(client);
    let options = MirrorOptions {
        target_directory: args.target_directory,
        temp_directory: args.temp_directory,
        num_threads: args.num_threads,
        minimum_free_space: args.minimum_free_space,
        max_retries: args.max_retries,
        show_progress: !args.no_progress,
        dry_run: args.dry_run,
    };

    event!(
        Level::INFO,
        "Resolving {} specs from {} channels with {}",
        specs.len(),
        channels.len(),
        resolver.backend_name()
    );
    for platform in platforms {
        let resolved = resolver.resolve(&channels, platform, &specs).await?;
        dispatch(&mirror, &resolved, &options).await?;
    }

    Ok(())
}

/// Parses the requested platforms, dropping duplicates
fn parse_platforms(names: &[String]) -> Result<Vec<Platform>, ConfigError> {
    let mut platforms = Vec::with_capacity(names.len());
    for name in names {
        let platform =
            Platform::from_str(name).map_err(|e| ConfigError::Platform(name.clone(), e))?;
        if !platforms.contains(&platform) {
            platforms.push(platform);
        }
    }
    Ok(platforms)
}

/// Parses the specs into match specs, dropping exact duplicates. At least one spec is required.
fn parse_specs<'a>(specs: impl IntoIterator<Item = &'a String>) -> Result<Vec<MatchSpec>, InputError> {
    let mut seen = Vec::new();
    let mut match_specs = Vec::new();
    for spec in specs {
        let spec = spec.trim();
        if seen.contains(&spec) {
            continue;
        }
        seen.push(spec);
        match_specs.push(
            MatchSpec::from_str(spec).map_err(|e| InputError::MatchSpec(spec.to_string(), e))?,
        );
    }

    if match_specs.is_empty() {
        return Err(InputError::NoSpecs);
    }
    Ok(match_specs)
}
