//! Turns (channels, platform, specs) into the concrete package files that satisfy the specs

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use rattler_conda_types::{GenericVirtualPackage, MatchSpec, Platform, RepoDataRecord};
use rattler_solve::{SolveError, SolverImpl, SolverTask};
use thiserror::Error;
use tracing::{event, Level};

use crate::available_packages_cache::AvailablePackagesCache;
use crate::channel::MirrorChannel;
use crate::cli::SolverChoice;
use crate::error::ConfigError;
use crate::fetch::FetchError;
use crate::resolved::ResolvedPackages;
use crate::virtual_packages::virtual_packages_for;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not find packages satisfying the specs:\n{}", .0.join("\n"))]
    Unsolvable(Vec<String>),
    #[error("the {0} solver failed")]
    Solver(&'static str, #[source] SolveError),
    #[error("the solver task was aborted")]
    Aborted(#[from] tokio::task::JoinError),
}

/// Everything a backend needs to solve for one platform
pub struct SolveInput<'a> {
    pub available_packages: Vec<&'a [RepoDataRecord]>,
    pub virtual_packages: Vec<GenericVirtualPackage>,
    pub specs: Vec<MatchSpec>,
    pub timeout: Option<Duration>,
}

impl<'a> SolveInput<'a> {
    fn into_task(self) -> SolverTask<Vec<&'a [RepoDataRecord]>> {
        SolverTask {
            available_packages: self.available_packages,
            locked_packages: Vec::new(),
            pinned_packages: Vec::new(),
            virtual_packages: self.virtual_packages,
            specs: self.specs,
            timeout: self.timeout,
        }
    }
}

/// A solver implementation. Backends only compute a solution; nothing is installed anywhere.
pub trait SolverBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(&self, input: SolveInput<'_>) -> Result<Vec<RepoDataRecord>, SolveError>;
}

/// The resolvo solver, a CDCL solver written in Rust
#[cfg(feature = "resolvo")]
pub struct Resolvo;

#[cfg(feature = "resolvo")]
impl SolverBackend for Resolvo {
    fn name(&self) -> &'static str {
        "resolvo"
    }

    fn solve(&self, input: SolveInput<'_>) -> Result<Vec<RepoDataRecord>, SolveError> {
        rattler_solve::resolvo::Solver.solve(input.into_task())
    }
}

/// The libsolv solver, as used by mamba
#[cfg(feature = "libsolv_c")]
pub struct LibsolvC;

#[cfg(feature = "libsolv_c")]
impl SolverBackend for LibsolvC {
    fn name(&self) -> &'static str {
        "libsolv"
    }

    fn solve(&self, input: SolveInput<'_>) -> Result<Vec<RepoDataRecord>, SolveError> {
        rattler_solve::libsolv_c::Solver.solve(input.into_task())
    }
}

/// Picks the backend for `choice`. `auto` prefers resolvo and falls back to libsolv, explicitly
/// asking for a backend this binary was built without is an error.
pub fn select_backend(choice: SolverChoice) -> Result<Arc<dyn SolverBackend>, ConfigError> {
    match choice {
        SolverChoice::Resolvo => resolvo_backend().ok_or(ConfigError::UnavailableSolver("resolvo")),
        SolverChoice::LibsolvC => {
            libsolv_c_backend().ok_or(ConfigError::UnavailableSolver("libsolv-c"))
        }
        SolverChoice::Auto => resolvo_backend()
            .or_else(libsolv_c_backend)
            .ok_or(ConfigError::NoSolver),
    }
}

fn resolvo_backend() -> Option<Arc<dyn SolverBackend>> {
    #[cfg(feature = "resolvo")]
    return Some(Arc::new(Resolvo));
    #[cfg(not(feature = "resolvo"))]
    return None;
}

fn libsolv_c_backend() -> Option<Arc<dyn SolverBackend>> {
    #[cfg(feature = "libsolv_c")]
    return Some(Arc::new(LibsolvC));
    #[cfg(not(feature = "libsolv_c"))]
    return None;
}

/// Resolves specs one platform at a time, sharing downloaded repodata between platforms
pub struct Resolver {
    backend: Arc<dyn SolverBackend>,
    available_packages: AvailablePackagesCache,
    virtual_package_overrides: Vec<GenericVirtualPackage>,
    timeout: Option<Duration>,
}

impl Resolver {
    pub fn new(
        backend: Arc<dyn SolverBackend>,
        available_packages: AvailablePackagesCache,
        virtual_package_overrides: Vec<GenericVirtualPackage>,
        timeout: Option<Duration>,
    ) -> Resolver {
        Resolver {
            backend,
            available_packages,
            virtual_package_overrides,
            timeout,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Solves `specs` for `platform`. The result only contains packages of `platform` and
    /// `noarch`, grouped by the channel they come from.
    #[tracing::instrument(level = Level::DEBUG, skip_all, fields(platform = %platform))]
    pub async fn resolve(
        &self,
        channels: &[MirrorChannel],
        platform: Platform,
        specs: &[MatchSpec],
    ) -> Result<ResolvedPackages, ResolveError> {
        let mut platforms = vec![platform];
        if platform != Platform::NoArch {
            platforms.push(Platform::NoArch);
        }

        let available_packages = try_join_all(channels.iter().flat_map(|channel| {
            platforms
                .iter()
                .map(move |platform| self.available_packages.get(channel, *platform))
        }))
        .await?;

        let backend = self.backend.clone();
        let virtual_packages = virtual_packages_for(platform, &self.virtual_package_overrides);
        let specs = specs.to_vec();
        let timeout = self.timeout;

        event!(
            Level::INFO,
            "Solving {} specs for {platform} with {}",
            specs.len(),
            backend.name()
        );
        let solve_start = std::time::Instant::now();
        let records = tokio::task::spawn_blocking(move || {
            let input = SolveInput {
                available_packages: available_packages
                    .iter()
                    .map(|records| records.as_slice())
                    .collect(),
                virtual_packages,
                specs,
                timeout,
            };
            backend.solve(input).map_err(|e| match e {
                SolveError::Unsolvable(problems) => ResolveError::Unsolvable(problems),
                e => ResolveError::Solver(backend.name(), e),
            })
        })
        .await??;
        event!(
            Level::INFO,
            "Solved {platform}: {} packages in {} ms",
            records.len(),
            solve_start.elapsed().as_millis()
        );

        Ok(ResolvedPackages::from_records(records, channels))
    }
}
