//! hushwire simulation binary.
//!
//! Runs a scripted conversation between in-memory users and devices through
//! the full E2EE pipeline and logs the outcome.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 3 users with 2 devices each
//! hushwire-sim
//!
//! # Larger population, flaky directory, verbose logs
//! hushwire-sim --users 8 --devices 3 --inject-failures 2 --log-level debug
//! ```

mod scenario;

use clap::Parser;
use hushwire_core::CryptoConfig;
use scenario::{Scenario, ScenarioConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// hushwire E2EE simulation
#[derive(Parser, Debug)]
#[command(name = "hushwire-sim")]
#[command(about = "Multi-user, multi-device E2EE scenario runner")]
#[command(version)]
struct Args {
    /// Number of users
    #[arg(short, long, default_value = "3")]
    users: usize,

    /// Devices per user
    #[arg(short, long, default_value = "2")]
    devices: usize,

    /// Direct messages each user sends
    #[arg(long, default_value = "3")]
    direct_rounds: usize,

    /// Group messages each user sends
    #[arg(long, default_value = "3")]
    group_rounds: usize,

    /// Directory calls that fail with a network error before the direct phase
    #[arg(long, default_value = "0")]
    inject_failures: usize,

    /// Base seed for every device's randomness
    #[arg(long, default_value = "1")]
    seed: u64,

    /// One-time prekeys generated per device
    #[arg(long, default_value = "10")]
    prekeys: usize,

    /// Replenish prekeys below this count
    #[arg(long, default_value = "5")]
    low_water_mark: usize,

    /// Directory call timeout in milliseconds
    #[arg(long, default_value = "10000")]
    claim_timeout_ms: u64,

    /// Do not retry directory calls after a network error
    #[arg(long)]
    no_retry: bool,

    /// Re-claim an exhausted device once after this many milliseconds
    #[arg(long)]
    exhausted_retry_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn scenario(&self) -> ScenarioConfig {
        ScenarioConfig {
            users: self.users,
            devices_per_user: self.devices,
            direct_rounds: self.direct_rounds,
            group_rounds: self.group_rounds,
            injected_failures: self.inject_failures,
            seed: self.seed,
            crypto: CryptoConfig {
                initial_prekey_count: self.prekeys,
                prekey_low_water_mark: self.low_water_mark,
                claim_timeout_ms: self.claim_timeout_ms,
                retry_network_errors: !self.no_retry,
                exhausted_retry_delay_ms: self.exhausted_retry_ms,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("hushwire simulation starting");
    tracing::info!("{} users, {} devices each, seed {}", args.users, args.devices, args.seed);

    let summary = Scenario::setup(args.scenario()).await?.run().await?;

    tracing::info!(
        sent = summary.sent,
        delivered = summary.delivered,
        keys_installed = summary.keys_installed,
        skipped = summary.skipped,
        replenished = summary.replenished,
        "simulation finished"
    );

    if summary.placeholders > 0 {
        tracing::warn!("{} messages rendered as placeholders", summary.placeholders);
        return Err(format!("{} messages failed to decrypt", summary.placeholders).into());
    }

    Ok(())
}
