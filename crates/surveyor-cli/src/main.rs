//! CLI for surveyor — decide when a machine judgment may stand on its own.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "surveyor")]
#[command(about = "surveyor — safety-constrained automate/escalate decisions")]
#[command(version = surveyor_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP decision server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8042")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Engine config JSON (defaults apply to missing keys)
        #[arg(long)]
        config: Option<String>,

        /// State directory for model, calibration and FNR records
        #[arg(long)]
        state: Option<String>,

        /// Force shadow mode regardless of config
        #[arg(long)]
        shadow: bool,
    },

    /// Evaluate one assessment from a JSON file ("-" for stdin)
    Evaluate {
        /// Request JSON: {"evidence": [...], "situational": {...}, "stratum": "..."}
        input: String,

        /// Engine config JSON
        #[arg(long)]
        config: Option<String>,

        /// State directory to load learned state from
        #[arg(long)]
        state: Option<String>,

        /// Print the decision as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run the engine against a synthetic assessment stream and audit it
    Simulate {
        /// Number of assessments
        #[arg(long, default_value = "5000")]
        assessments: usize,

        /// Number of strata (1-8); later strata have less reliable judgments
        #[arg(long, default_value = "4")]
        strata: usize,

        /// Fraction of positive outcomes that carry a critical hazard
        #[arg(long, default_value = "0.3")]
        hazard_share: f64,

        /// RNG seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Engine config JSON
        #[arg(long)]
        config: Option<String>,

        /// Persist learned state to this directory
        #[arg(long)]
        state: Option<String>,

        /// Write the simulation summary as JSON
        #[arg(long)]
        output: Option<String>,
    },

    /// Audit calibration coverage and automation FNR from a state directory
    Audit {
        /// State directory written by `serve` or `simulate --state`
        #[arg(long)]
        state: String,

        /// Engine config JSON (coverage level, FNR limit, min samples)
        #[arg(long)]
        config: Option<String>,

        /// Write a Markdown report to this path
        #[arg(long)]
        output: Option<String>,
    },

    /// Print the effective engine configuration
    Config {
        /// Config JSON to validate and merge over defaults
        #[arg(long)]
        config: Option<String>,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            host,
            config,
            state,
            shadow,
        } => commands::serve::run(&host, port, config.as_deref(), state.as_deref(), shadow),
        Commands::Evaluate {
            input,
            config,
            state,
            json,
        } => commands::evaluate::run(&input, config.as_deref(), state.as_deref(), json),
        Commands::Simulate {
            assessments,
            strata,
            hazard_share,
            seed,
            config,
            state,
            output,
        } => commands::simulate::run(commands::simulate::SimulateCommandConfig {
            assessments,
            strata,
            hazard_share,
            seed,
            config_path: config.as_deref(),
            state_dir: state.as_deref(),
            output_path: output.as_deref(),
        }),
        Commands::Audit {
            state,
            config,
            output,
        } => commands::audit::run(&state, config.as_deref(), output.as_deref()),
        Commands::Config { config } => commands::config::run(config.as_deref()),
    }
}
