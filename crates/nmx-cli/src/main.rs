//! NMX CLI
//!
//! Command-line interface for the NMX emission engine: schedule tables, the built-in
//! weekly schedule and scenario replay against a configured deployment.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nmx_core::{amount_serde, Amount};
use nmx_economics::config::NmxConfig;
use nmx_economics::{MintPool, MintSchedule, Protocol, ProtocolConfig, Scenario, StepOutcome, MAX_SUPPLY, ONE_NMX};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "nmx")]
#[command(version)]
#[command(about = "NMX emission schedule, staking and referral bonus engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print cumulative emission per pool
    Schedule {
        /// Deployment file; the built-in schedule when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// First printed time (seconds)
        #[arg(long, default_value = "0")]
        from: u64,

        /// Last printed time (seconds)
        #[arg(long, default_value = "2419200")]
        to: u64,

        /// Distance between printed rows (seconds)
        #[arg(long, default_value = "604800")]
        step: u64,

        /// Only these pools (repeatable)
        #[arg(long, value_parser = parse_pool)]
        pool: Vec<MintPool>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Dump the built-in weekly schedule as TOML
    DefaultSchedule,

    /// Replay a scenario against a deployment
    Simulate {
        /// Deployment file
        #[arg(short, long, default_value = "nmx.toml")]
        config: PathBuf,

        /// Scenario file (JSON)
        #[arg(short, long)]
        scenario: PathBuf,

        /// Stop and fail on the first rejected step
        #[arg(long)]
        strict: bool,
    },

    /// Version information
    Version,
}

fn init_logging(verbose: bool, json: bool) {
    let env_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn parse_pool(s: &str) -> Result<MintPool, String> {
    MintPool::ALL
        .into_iter()
        .find(|pool| pool.name().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown pool '{s}', expected one of: default, primary, bonus, team, nominex"))
}

/// Deployment from a TOML file, with `NMX_*` environment overrides
/// (`NMX_CHAIN_ID=56`, `NMX_NMX__OUTPUT_RATE=0.5`).
fn load_config(path: &Path) -> anyhow::Result<ProtocolConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).format(config::FileFormat::Toml))
        .add_source(
            config::Environment::with_prefix("NMX")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("failed to read {}", path.display()))?;
    let deployment: ProtocolConfig = settings
        .try_deserialize()
        .with_context(|| format!("invalid deployment in {}", path.display()))?;
    deployment.validate()?;
    Ok(deployment)
}

/// Whole NMX with six decimals, floored
fn format_nmx(amount: Amount) -> String {
    let micro = amount / (ONE_NMX / 1_000_000);
    format!("{}.{:06}", micro / 1_000_000, micro % 1_000_000)
}

fn format_time(t: u64) -> String {
    i64::try_from(t)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[derive(Serialize)]
struct PoolTotal {
    pool: MintPool,
    /// Cumulative emission since distribution start, in wei
    #[serde(with = "amount_serde")]
    emitted: Amount,
}

#[derive(Serialize)]
struct ScheduleRow {
    time: u64,
    date: String,
    pools: Vec<PoolTotal>,
}

/// Cumulative emission of `pools` at `from`, `from + step`, ... up to `to`
fn schedule_rows(
    schedule: &MintSchedule,
    start: u64,
    pools: &[MintPool],
    from: u64,
    to: u64,
    step: u64,
) -> anyhow::Result<Vec<ScheduleRow>> {
    if step == 0 {
        bail!("--step must be positive");
    }
    let mut states: Vec<_> = pools.iter().map(|_| schedule.initial_state(start)).collect();
    let mut totals: Vec<Amount> = vec![0; pools.len()];
    let mut rows = Vec::new();

    let mut t = from;
    while t <= to {
        for (i, pool) in pools.iter().enumerate() {
            let (emitted, next) = schedule.make_progress(&states[i], t, *pool)?;
            totals[i] = totals[i]
                .checked_add(emitted)
                .context("emission total overflow")?;
            states[i] = next;
        }
        let emitted = totals.iter().fold(0u128, |acc, total| acc.saturating_add(*total));
        if emitted > MAX_SUPPLY {
            tracing::warn!(time = t, emitted = %format_nmx(emitted), "cumulative emission exceeds the supply cap");
        }
        rows.push(ScheduleRow {
            time: t,
            date: format_time(t),
            pools: pools
                .iter()
                .zip(&totals)
                .map(|(pool, total)| PoolTotal {
                    pool: *pool,
                    emitted: *total,
                })
                .collect(),
        });
        t = match t.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(rows)
}

#[derive(Serialize)]
struct BalanceRow {
    token: String,
    symbol: String,
    holder: String,
    amount: String,
}

#[derive(Serialize)]
struct StakerRow {
    service: String,
    owner: String,
    staked: String,
    reward: String,
}

#[derive(Serialize)]
struct SimulationReport<'a> {
    outcomes: &'a [StepOutcome],
    final_time: u64,
    /// Primary pool per-tick emission at `final_time`, in wei
    #[serde(with = "amount_serde")]
    reward_rate: Amount,
    balances: Vec<BalanceRow>,
    stakers: Vec<StakerRow>,
}

fn report<'a>(protocol: &Protocol, outcomes: &'a [StepOutcome]) -> anyhow::Result<SimulationReport<'a>> {
    let balances = protocol
        .ledger()
        .tokens()
        .flat_map(|(token, book)| {
            book.balances
                .iter()
                .filter(|(_, amount)| **amount > 0)
                .map(move |(holder, amount)| BalanceRow {
                    token: token.to_string(),
                    symbol: book.symbol.clone(),
                    holder: holder.to_string(),
                    amount: amount.to_string(),
                })
        })
        .collect();
    let stakers = protocol
        .services()
        .flat_map(|service| {
            service.stakers().map(move |(owner, staker)| StakerRow {
                service: service.address().to_string(),
                owner: owner.to_string(),
                staked: staker.amount.to_string(),
                reward: staker.reward.to_string(),
            })
        })
        .collect();
    Ok(SimulationReport {
        outcomes,
        final_time: protocol.last_time(),
        reward_rate: protocol.nmx().reward_rate()?,
        balances,
        stakers,
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Schedule {
            config,
            from,
            to,
            step,
            pool,
            json,
        } => {
            let deployment = match &config {
                Some(path) => load_config(path)?,
                None => ProtocolConfig::default(),
            };
            let protocol = Protocol::from_config(&deployment)?;
            let pools = if pool.is_empty() {
                MintPool::ALL[1..].to_vec()
            } else {
                pool
            };
            tracing::info!(from, to, step, pools = pools.len(), "computing schedule");

            let rows = schedule_rows(
                protocol.nmx().schedule(),
                deployment.start_time,
                &pools,
                from,
                to,
                step,
            )?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                let header: Vec<String> = pools.iter().map(|p| format!("{:>22}", p.name())).collect();
                println!("{:>12}  {:<19}{}", "time", "date", header.join(""));
                for row in rows {
                    let cells: Vec<String> = row
                        .pools
                        .iter()
                        .map(|total| format!("{:>22}", format_nmx(total.emitted)))
                        .collect();
                    println!("{:>12}  {:<19}{}", row.time, row.date, cells.join(""));
                }
            }
        }

        Commands::DefaultSchedule => {
            #[derive(Serialize)]
            struct ScheduleFile {
                nmx: NmxConfig,
            }

            let owner = ProtocolConfig::default().owner;
            let file = ScheduleFile {
                nmx: NmxConfig {
                    items: Some(MintSchedule::nominex_default(owner).items().to_vec()),
                    ..NmxConfig::default()
                },
            };
            print!("{}", toml::to_string_pretty(&file)?);
        }

        Commands::Simulate {
            config,
            scenario,
            strict,
        } => {
            let deployment = load_config(&config)?;
            let mut protocol = Protocol::from_config(&deployment)?;

            let content = std::fs::read_to_string(&scenario)
                .with_context(|| format!("failed to read {}", scenario.display()))?;
            let scenario: Scenario = serde_json::from_str(&content)
                .with_context(|| format!("invalid scenario in {}", scenario.display()))?;
            tracing::info!(steps = scenario.steps.len(), strict, "replaying scenario");

            let mut outcomes = Vec::with_capacity(scenario.steps.len());
            let mut failure = None;
            for (index, step) in scenario.steps.iter().enumerate() {
                let mut outcome = protocol
                    .replay(std::slice::from_ref(step))
                    .pop()
                    .context("replay returned no outcome")?;
                outcome.index = index;
                let failed = !outcome.is_ok();
                if failed && failure.is_none() {
                    failure = Some(format!(
                        "step {index} ({}) at {} failed: {}",
                        outcome.operation,
                        outcome.at,
                        outcome.error.clone().unwrap_or_default()
                    ));
                }
                outcomes.push(outcome);
                if failed && strict {
                    break;
                }
            }

            println!("{}", serde_json::to_string_pretty(&report(&protocol, &outcomes)?)?);
            if let (true, Some(failure)) = (strict, failure) {
                bail!(failure);
            }
        }

        Commands::Version => {
            println!("nmx v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Features:");
            println!("  - Piecewise weekly emission over five pools");
            println!("  - Output rate throttle");
            println!("  - Staking router with per-service shares");
            println!("  - Historical reward rate staking");
            println!("  - Referral and referrer bonuses");
            println!("  - Signed permits and relayed authorizations");
        }
    }

    Ok(())
}
