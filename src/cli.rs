use std::path::PathBuf;

use clap::Parser;

/// Download the packages needed to install a set of conda package specs, laid out like the
/// upstream channels they came from.
#[derive(Parser, Debug)]
#[command(name = "conda-download", version, about)]
pub struct Args {
    /// Conda channel(s) to resolve against. Defaults to conda-forge.
    #[arg(short, long = "channel", value_name = "CHANNEL")]
    pub channels: Vec<String>,

    /// The place where packages should be mirrored to. Every channel gets its own subdirectory.
    #[arg(short, long, env = "CONDA_DOWNLOAD_TARGET_DIR", value_hint = clap::ValueHint::DirPath)]
    pub target_directory: PathBuf,

    /// Temporary download location for packages and repodata.
    #[arg(long, default_value = std::env::temp_dir().into_os_string(), env = "CONDA_DOWNLOAD_TEMP_DIR", value_hint = clap::ValueHint::DirPath)]
    pub temp_directory: PathBuf,

    /// The OS platform(s) to mirror, e.g. 'linux-64', 'osx-64', 'win-64'.
    #[arg(long = "platform", required = true, value_name = "PLATFORM")]
    pub platforms: Vec<String>,

    /// Logging defaults to errors only. '-v': warning, '-vv': info, '-vvv': debug.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// The solver implementation to use.
    #[arg(long, value_enum, default_value_t, env = "CONDA_DOWNLOAD_SOLVER")]
    pub solver: SolverChoice,

    /// Number of concurrent downloads per channel and platform. 0 uses all available cores.
    #[arg(long, default_value_t = 1, env = "CONDA_DOWNLOAD_NUM_THREADS")]
    pub num_threads: usize,

    /// Show what would be downloaded without downloading or validating anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Threshold for free disk space in the target directory, in megabytes.
    #[arg(long, default_value_t = 1000, env = "CONDA_DOWNLOAD_MINIMUM_FREE_SPACE")]
    pub minimum_free_space: u64,

    /// Maximum number of retries before a download error is reported.
    #[arg(long, default_value_t = 100, env = "CONDA_DOWNLOAD_MAX_RETRIES")]
    pub max_retries: u32,

    /// Do not display progress bars.
    #[arg(long)]
    pub no_progress: bool,

    /// An environment.yml file whose channels and dependencies are added to the request.
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub file: Option<PathBuf>,

    /// Override or add a virtual package of the target platform, as NAME=VERSION[=BUILD].
    #[arg(long = "virtual-package", value_name = "SPEC")]
    pub virtual_packages: Vec<String>,

    /// Give up solving after this many seconds.
    #[arg(long, env = "CONDA_DOWNLOAD_SOLVE_TIMEOUT")]
    pub solve_timeout: Option<u64>,

    /// Package specifications, e.g. 'python>=3.10' or 'numpy 1.26.*'.
    #[arg(value_name = "PACKAGES")]
    pub packages: Vec<String>,
}

/// Which solver backend resolves the specs
#[derive(Clone, clap::ValueEnum, Default, Copy, Debug, PartialEq, Eq)]
pub enum SolverChoice {
    /// Use resolvo when it is compiled in, libsolv otherwise
    #[default]
    Auto,
    #[value(alias = "conda")]
    Resolvo,
    #[value(alias = "mamba")]
    LibsolvC,
}

impl Args {
    /// The tracing filter directive matching the amount of `-v` flags
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::ERROR,
            1 => tracing::Level::WARN,
            2 => tracing::Level::INFO,
            _ => tracing::Level::DEBUG,
        }
    }
}
