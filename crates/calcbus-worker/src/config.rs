use anyhow::bail;
use calcbus::SubscriberConfig;
use calcbus::bus::MemoryBusConfig;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `calcbus-worker` binary.
///
/// These settings control delivery concurrency, the redelivery budget, and
/// the shutdown behavior of the in-process pipeline. All values are parsed
/// from CLI arguments or environment variables, with defaults suitable for
/// interactive use.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "calcbus-worker",
    version,
    about = "Runs the calculation pipeline end to end over the in-memory bus"
)]
pub struct CliArgs {
    /// Requester identity recorded on every dispatched calculation.
    ///
    /// Environment variable: `CALC_OWNER`
    #[arg(long, env = "CALC_OWNER", default_value = "demo")]
    pub owner: String,

    /// Expression to dispatch; repeat for several, e.g.
    /// `--expression "2+2" --expression "10/4"`.
    #[arg(long = "expression", required = true)]
    pub expressions: Vec<String>,

    /// Maximum deliveries handled concurrently per channel.
    ///
    /// Environment variable: `MAX_INFLIGHT`
    #[arg(long, env = "MAX_INFLIGHT", default_value_t = 16)]
    pub max_inflight: usize,

    /// Delivery attempts (including the first) before a message is
    /// dead-lettered.
    ///
    /// Environment variable: `MAX_DELIVERY_ATTEMPTS`
    #[arg(long, env = "MAX_DELIVERY_ATTEMPTS", default_value_t = 5)]
    pub max_delivery_attempts: u32,

    /// Pause between redeliveries, in milliseconds.
    ///
    /// Environment variable: `REDELIVERY_BACKOFF_MS`
    #[arg(long, env = "REDELIVERY_BACKOFF_MS", default_value_t = 25)]
    pub redelivery_backoff_ms: u64,

    /// Upper bound on the graceful-drain wait at shutdown, in seconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,

    /// How long to wait for the dispatched calculations to complete before
    /// giving up, in seconds.
    ///
    /// Environment variable: `COMPLETION_TIMEOUT_SECS`
    #[arg(long, env = "COMPLETION_TIMEOUT_SECS", default_value_t = 10)]
    pub completion_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub owner: String,
    pub expressions: Vec<String>,
    pub subscriber: SubscriberConfig,
    pub bus: MemoryBusConfig,
    pub completion_timeout: Duration,
}

impl TryFrom<CliArgs> for WorkerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_inflight == 0 {
            bail!("MAX_INFLIGHT must be greater than 0");
        }
        if args.max_delivery_attempts == 0 {
            bail!("MAX_DELIVERY_ATTEMPTS must be greater than 0");
        }

        Ok(Self {
            owner: args.owner,
            expressions: args.expressions,
            subscriber: SubscriberConfig {
                max_inflight: args.max_inflight,
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            },
            bus: MemoryBusConfig {
                max_attempts: args.max_delivery_attempts,
                redelivery_backoff: Duration::from_millis(args.redelivery_backoff_ms),
                ..MemoryBusConfig::default()
            },
            completion_timeout: Duration::from_secs(args.completion_timeout_secs),
        })
    }
}
