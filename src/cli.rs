//! Command Line Interface (CLI) arguments.

use crate::error::EnsembleError;
use crate::options::{Operation, Options, SobolMethod};

use clap::Parser;
use expanduser::expanduser;
use validator::Validate;

/// Ensemblist command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// Number of timesteps each simulation sends
    #[arg(long, env = "ENSEMBLIST_NB_TIME_STEPS")]
    pub nb_time_steps: usize,
    /// Number of varying parameters of the study
    #[arg(long, default_value_t = 0, env = "ENSEMBLIST_NB_PARAMETERS")]
    pub nb_parameters: usize,
    /// Number of design points (simulation groups) to wait for
    #[arg(long, env = "ENSEMBLIST_SAMPLING_SIZE")]
    pub sampling_size: usize,
    /// Colon separated statistics to compute, e.g. mean:variance:min_max
    #[arg(
        long,
        value_enum,
        value_delimiter = ':',
        default_value = "mean:variance",
        env = "ENSEMBLIST_OPERATIONS"
    )]
    pub operations: Vec<Operation>,
    /// Colon separated threshold values
    #[arg(long, value_delimiter = ':', env = "ENSEMBLIST_THRESHOLDS")]
    pub thresholds: Vec<f64>,
    /// Colon separated quantile orders in (0, 1)
    #[arg(long, value_delimiter = ':', env = "ENSEMBLIST_QUANTILES")]
    pub quantiles: Vec<f64>,
    /// 1 for first order Sobol' indices, 2 to also require total order convergence
    #[arg(long, default_value_t = 1, env = "ENSEMBLIST_SOBOL_MAX_ORDER")]
    pub sobol_max_order: u8,
    /// Colon separated names of the fields simulations send
    #[arg(long, value_delimiter = ':', required = true, env = "ENSEMBLIST_FIELDS")]
    pub fields: Vec<String>,
    /// Seconds between checkpoints
    #[arg(long, default_value_t = 300, env = "ENSEMBLIST_CHECKPOINT_INTERVAL")]
    pub checkpoint_interval: u64,
    /// Seconds without data after which a running simulation is reset
    #[arg(long, default_value_t = 300, env = "ENSEMBLIST_TIMEOUT_SIMU")]
    pub timeout_simu: u64,
    /// Seconds without launcher messages before a warning and a checkpoint
    #[arg(long, default_value_t = 100, env = "ENSEMBLIST_LAUNCHER_TIMEOUT")]
    pub launcher_timeout: u64,
    /// Directory holding checkpoint files
    #[arg(
        long,
        default_value = "~/.local/share/ensemblist/restart",
        env = "ENSEMBLIST_RESTART_DIR"
    )]
    pub restart_dir: String,
    /// Restore state from the restart directory on startup
    #[arg(long, default_value_t = false, env = "ENSEMBLIST_RESTART")]
    pub restart: bool,
    /// Whether simulations run in learning mode
    #[arg(long, default_value_t = false, env = "ENSEMBLIST_LEARNING_MODE")]
    pub learning_mode: bool,
    /// Verbosity passed on to simulations. 2 or more also enables debug logs.
    #[arg(long, default_value_t = 1, env = "ENSEMBLIST_VERBOSITY")]
    pub verbosity: i32,
    /// Stop once every Sobol' confidence interval is narrower than this
    #[arg(long, env = "ENSEMBLIST_CONVERGENCE_TOLERANCE")]
    pub convergence_tolerance: Option<f64>,
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "ENSEMBLIST_HOST")]
    pub host: String,
    /// Host name simulations use to reach the data ports
    #[arg(long, default_value = "127.0.0.1", env = "ENSEMBLIST_ADVERTISE_HOST")]
    pub advertise_host: String,
    /// The port on which simulations connect for the handshake
    #[arg(long, default_value_t = 5000, env = "ENSEMBLIST_CONNECTION_PORT")]
    pub connection_port: u16,
    /// First data port. Rank r listens on this port plus r.
    #[arg(long, default_value_t = 5100, env = "ENSEMBLIST_DATA_PORT")]
    pub data_port: u16,
    /// Number of server ranks to run in this process
    #[arg(long, default_value_t = 1, env = "ENSEMBLIST_SERVER_RANKS")]
    pub server_ranks: usize,
    /// Launcher address as host:port
    #[arg(long, env = "ENSEMBLIST_LAUNCHER_ADDR")]
    pub launcher_addr: Option<String>,
    /// The port for the HTTP status and metrics endpoints
    #[arg(long, default_value_t = 8080, env = "ENSEMBLIST_HTTP_PORT")]
    pub http_port: u16,
    /// Maximum time in seconds to wait for HTTP requests to complete upon receiving a signal.
    #[arg(long, default_value_t = 10, env = "ENSEMBLIST_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "ENSEMBLIST_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
}

impl CommandLineArgs {
    /// Builds and validates the [Options] these arguments describe.
    pub fn options(&self) -> Result<Options, EnsembleError> {
        if self.server_ranks == 0 {
            return Err(EnsembleError::protocol("server_ranks must be greater than 0"));
        }
        if usize::from(self.data_port) + self.server_ranks > usize::from(u16::MAX) + 1 {
            return Err(EnsembleError::protocol(format!(
                "{} server ranks do not fit above data port {}",
                self.server_ranks, self.data_port
            )));
        }
        let options = Options {
            nb_time_steps: self.nb_time_steps,
            nb_parameters: self.nb_parameters,
            sampling_size: self.sampling_size,
            operations: self.operations.clone(),
            thresholds: self.thresholds.clone(),
            quantiles: self.quantiles.clone(),
            sobol_method: SobolMethod::Martinez,
            sobol_max_order: self.sobol_max_order,
            fields: self.fields.clone(),
            checkpoint_interval: self.checkpoint_interval,
            timeout_simu: self.timeout_simu,
            launcher_timeout: self.launcher_timeout,
            restart_dir: expanduser(&self.restart_dir)?,
            restart: self.restart,
            learning_mode: self.learning_mode,
            verbosity: self.verbosity,
            convergence_tolerance: self.convergence_tolerance,
        };
        options.validate()?;
        Ok(options)
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
