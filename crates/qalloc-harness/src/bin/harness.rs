//! CLI entrypoint for the qalloc verification harness.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use qalloc_harness::{
    LogEmitter, LogLevel, StormConfig, StormType, run_reuse_scenario, run_storm,
    run_storm_with_log, run_threaded_storm, validate_log,
};

/// Verification tooling for the qalloc heap.
#[derive(Debug, Parser)]
#[command(name = "qalloc-harness")]
#[command(about = "Storms, scenarios and log export for the qalloc heap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an allocation storm and print its JSON report.
    Storm {
        /// Workload shape. Runs every storm when omitted.
        #[arg(long, value_enum)]
        storm: Option<StormType>,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Operations per storm.
        #[arg(long, default_value_t = 20_000)]
        ops: usize,
        /// Number of live-block slots.
        #[arg(long, default_value_t = 256)]
        slots: usize,
        /// Largest request size in bytes.
        #[arg(long, default_value_t = 4096)]
        max_size: usize,
        /// Run the integrity checker every N operations.
        #[arg(long, default_value_t = 1)]
        check_every: usize,
        /// Drive random churn from this many threads through one locked heap.
        #[arg(long)]
        threads: Option<usize>,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the reuse and growth scenario.
    Scenario {
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Export the lifecycle log of a storm as JSONL.
    Trace {
        #[arg(long, value_enum, default_value = "random-churn")]
        storm: StormType,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        #[arg(long, default_value_t = 1_000)]
        ops: usize,
        /// Lowest level recorded.
        #[arg(long, value_enum, default_value = "debug")]
        level: LogLevel,
        /// Output JSONL path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate an exported JSONL lifecycle log.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let cleaned = raw.trim().replace('_', "");
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid seed {raw:?}: {err}"))
}

fn open_output(output: Option<&PathBuf>) -> Result<Box<dyn Write>, std::io::Error> {
    Ok(match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(std::io::stdout().lock()),
    })
}

fn write_json<T: serde::Serialize>(
    value: &T,
    output: Option<&PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut out = open_output(output)?;
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Storm {
            storm,
            seed,
            ops,
            slots,
            max_size,
            check_every,
            threads,
            output,
        } => {
            let seed = parse_seed(&seed)?;
            let configure = |storm| StormConfig {
                ops,
                slots,
                max_size,
                check_every,
                ..StormConfig::new(storm, seed)
            };
            let reports = if let Some(threads) = threads {
                vec![run_threaded_storm(
                    &configure(StormType::RandomChurn),
                    threads,
                )?]
            } else {
                let storms = match storm {
                    Some(storm) => vec![storm],
                    None => StormType::all().to_vec(),
                };
                let mut reports = Vec::with_capacity(storms.len());
                for storm in storms {
                    eprintln!("Running {} storm (seed {seed:#x})", storm.as_str());
                    reports.push(run_storm(&configure(storm))?);
                }
                reports
            };
            write_json(&reports, output.as_ref())?;
        }
        Command::Scenario { output } => {
            let report = run_reuse_scenario()?;
            write_json(&report, output.as_ref())?;
            eprintln!("Scenario passed");
        }
        Command::Trace {
            storm,
            seed,
            ops,
            level,
            output,
        } => {
            let config = StormConfig {
                ops,
                ..StormConfig::new(storm, parse_seed(&seed)?)
            };
            let (_, entries) = run_storm_with_log(&config, level.into())?;
            let mut emitter = LogEmitter::new(open_output(output.as_ref())?);
            for entry in &entries {
                emitter.emit(entry)?;
            }
            eprintln!("Wrote {} log lines", emitter.lines());
            emitter.into_inner().flush()?;
        }
        Command::ValidateLog { log } => {
            let content = std::fs::read_to_string(&log)?;
            let entries = validate_log(&content)?;
            eprintln!("{}: {} valid entries", log.display(), entries.len());
        }
    }

    Ok(())
}
