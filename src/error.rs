//! Contains the errors that can end a download run

use rattler_conda_types::{ParseMatchSpecError, ParsePlatformError};
use thiserror::Error;

use crate::channel::ChannelError;
use crate::download::TransferError;
use crate::environment::EnvironmentFileError;
use crate::solver::ResolveError;
use crate::virtual_packages::VirtualPackageError;

#[derive(Debug, Error)]
pub enum DownloaderError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("input error: {0}")]
    Input(#[from] InputError),
    #[error("resolution error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

/// The command line asks for something that cannot be done
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the {0} solver is not available in this build")]
    UnavailableSolver(&'static str),
    #[error("no solver is available in this build")]
    NoSolver,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("invalid platform `{0}`")]
    Platform(String, #[source] ParsePlatformError),
    #[error(transparent)]
    VirtualPackage(#[from] VirtualPackageError),
    #[error("unable to create the temporary directory in {}", .0.display())]
    TempDirectory(std::path::PathBuf, #[source] std::io::Error),
}

/// The packages to resolve are malformed
#[derive(Debug, Error)]
pub enum InputError {
    #[error(transparent)]
    EnvironmentFile(#[from] EnvironmentFileError),
    #[error("invalid package specification `{0}`")]
    MatchSpec(String, #[source] ParseMatchSpecError),
    #[error("no package specifications given")]
    NoSpecs,
}
