use clap::{Parser, Subcommand};
use colored::*;
use std::io::Write;
use std::process;

use stormgate_core::{
    backend, experiment, gateway, BackendConfig, ConsoleSink, ExperimentConfig, GatewayConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "STORMGATE",
    version,
    about = "Adaptive retry gateway that keeps retry storms from melting a capacity-limited backend",
    after_help = "\x1b[1;36mEXAMPLES:\x1b[0m
  Start the backend simulator:    stormgate backend
  Start the adaptive gateway:     stormgate gateway
  Run the reliability experiment: stormgate experiment
  Preview the experiment plan:    stormgate experiment --dry-run
  Custom safety capacity:         stormgate gateway --capacity 80 --max-retries 5
  From a config file:             stormgate gateway --config gateway.json"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the adaptive gateway in front of the backend
    Gateway(GatewayArgs),
    /// Run the capacity-limited backend simulator
    Backend(BackendArgs),
    /// Drive phased traffic through the gateway
    Experiment(ExperimentArgs),
}

#[derive(clap::Args, Debug)]
pub struct GatewayArgs {
    #[arg(long, help = "JSON config file; flags are ignored when present")]
    pub config: Option<String>,

    #[arg(long, default_value_t = 3000, help = "Port to listen on")]
    pub port: u16,

    #[arg(long, default_value = "http://127.0.0.1:3001", help = "Backend base URL")]
    pub backend_url: String,

    #[arg(long, default_value_t = 50, help = "Backend safety capacity in req/window (C)")]
    pub capacity: u32,

    #[arg(long, default_value_t = 3, help = "Standard retry multiplier for load projection")]
    pub multiplier: u32,

    #[arg(long, default_value_t = 3, help = "Upper clamp on the retry budget")]
    pub max_retries: u32,

    #[arg(long, default_value_t = 1000, help = "Control window length in milliseconds")]
    pub window_ms: u64,

    #[arg(long, default_value_t = 500, help = "Per-attempt backend timeout in milliseconds")]
    pub timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
pub struct BackendArgs {
    #[arg(long, help = "JSON config file; flags are ignored when present")]
    pub config: Option<String>,

    #[arg(long, default_value_t = 3001, help = "Port to listen on")]
    pub port: u16,

    #[arg(long, default_value_t = 60, help = "Capacity in requests per second")]
    pub capacity: u64,

    #[arg(long, default_value_t = 0.0, help = "Initial injected failure probability [0, 1]")]
    pub failure_probability: f64,

    #[arg(long, default_value_t = false, help = "Disable the per-second dashboard")]
    pub no_dashboard: bool,
}

#[derive(clap::Args, Debug)]
pub struct ExperimentArgs {
    #[arg(long, help = "JSON config file; flags are ignored when present")]
    pub config: Option<String>,

    #[arg(long, default_value = "http://127.0.0.1:3000", help = "Gateway base URL")]
    pub gateway_url: String,

    #[arg(long, default_value = "http://127.0.0.1:3001", help = "Backend base URL (admin endpoint)")]
    pub backend_url: String,

    #[arg(long, default_value_t = 20, help = "Requests per second")]
    pub rate: u32,

    #[arg(long, default_value_t = 22, help = "Experiment duration in seconds")]
    pub duration: u64,

    #[arg(long, default_value_t = false, help = "Print the phase plan without sending traffic")]
    pub dry_run: bool,
}

#[tokio::main]
async fn main() {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    env_logger::init();
    print_banner();

    let args = Args::parse();
    let result = match args.command {
        Command::Gateway(cmd) => run_gateway(cmd).await,
        Command::Backend(cmd) => run_backend(cmd).await,
        Command::Experiment(cmd) => run_experiment(cmd).await,
    };

    if let Err(e) = result {
        eprint!("{}\r\n", format!("[!] {:#}", e).red());
        process::exit(1);
    }
}

fn print_banner() {
    let banner = r#"
   _____ _______ ____  _____  __  __  _____       _______ ______
  / ____|__   __/ __ \|  __ \|  \/  |/ ____|   /\|__   __|  ____|
 | (___    | | | |  | | |__) | \  / | |  __   /  \  | |  | |__
  \___ \   | | | |  | |  _  /| |\/| | | |_ | / /\ \ | |  |  __|
  ____) |  | | | |__| | | \ \| |  | | |__| |/ ____ \| |  | |____
 |_____/   |_|  \____/|_|  \_\_|  |_|\_____/_/    \_\_|  |______|
    "#;
    print!("{}\r\n", banner.bright_cyan().bold());
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

fn load_config<T: serde::de::DeserializeOwned>(path: &str) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config '{}': {}", path, e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow::anyhow!("invalid config '{}': {}", path, e))
}

async fn run_gateway(cmd: GatewayArgs) -> anyhow::Result<()> {
    let config = match cmd.config {
        Some(ref path) => load_config::<GatewayConfig>(path)?,
        None => GatewayConfig {
            listen_port: cmd.port,
            backend_url: cmd.backend_url,
            capacity_estimate: cmd.capacity,
            standard_retry_multiplier: cmd.multiplier,
            max_retries: cmd.max_retries,
            window_ms: cmd.window_ms,
            backend_timeout_ms: cmd.timeout_ms,
        },
    };
    config.validate()?;

    print!("{}\r\n", format!("[+] Listen port:  {}", config.listen_port).blue());
    print!("{}\r\n", format!("[+] Backend:      {}", config.backend_url).blue());
    print!("{}\r\n", format!("[+] Capacity (C): {} req/window", config.capacity_estimate).magenta().bold());
    print!("{}\r\n", format!("[+] Max retries:  {}", config.max_retries).magenta());
    print!("{}\r\n", format!("[+] Window:       {}ms", config.window_ms).blue());
    print!("{}\r\n", format!("[+] Timeout:      {}ms", config.backend_timeout_ms).blue());
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();

    gateway::run(config, ConsoleSink::new_ref()).await
}

async fn run_backend(cmd: BackendArgs) -> anyhow::Result<()> {
    let config = match cmd.config {
        Some(ref path) => load_config::<BackendConfig>(path)?,
        None => BackendConfig {
            listen_port: cmd.port,
            capacity: cmd.capacity,
            initial_failure_probability: cmd.failure_probability,
            dashboard: !cmd.no_dashboard,
            ..BackendConfig::default()
        },
    };
    config.validate()?;

    print!("{}\r\n", format!("[+] Listen port:  {}", config.listen_port).blue());
    print!("{}\r\n", format!("[+] Capacity:     {} req/s", config.capacity).magenta().bold());
    print!("{}\r\n", format!("[+] Injected:     {:.0}% failure rate", config.initial_failure_probability * 100.0).magenta());
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();

    backend::run(config, ConsoleSink::new_ref()).await
}

async fn run_experiment(cmd: ExperimentArgs) -> anyhow::Result<()> {
    let dry_run = cmd.dry_run;
    let config = match cmd.config {
        Some(ref path) => load_config::<ExperimentConfig>(path)?,
        None => ExperimentConfig {
            gateway_url: cmd.gateway_url,
            backend_url: cmd.backend_url,
            traffic_rate: cmd.rate,
            duration_secs: cmd.duration,
            ..ExperimentConfig::default()
        },
    };
    config.validate()?;

    if dry_run {
        for line in experiment::plan_lines(&config) {
            print!("{}\r\n", format!("[DRY RUN] {}", line).yellow());
        }
        std::io::stdout().flush().ok();
        return Ok(());
    }

    experiment::run(config, ConsoleSink::new_ref()).await
}
