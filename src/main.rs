//! CLI entry point for dotnet-bridge.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use colored::Colorize;
use dotenvy::dotenv;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use dotnet_bridge::config::{self, Config, ResolvedConfig};
use dotnet_bridge::error_taxonomy::CommandResponse;
use dotnet_bridge::guard::OperationKind;
use dotnet_bridge::logging;
use dotnet_bridge::serve;
use dotnet_bridge::service::{BridgeService, OperationRequest};

#[derive(Parser, Debug)]
#[command(
    name = "dotnet-bridge",
    author,
    version,
    about = "Guarded, classified execution of dotnet CLI commands",
    long_about = "Runs dotnet SDK commands with conflict detection, bounded output capture,\ncancellation and structured error classification.\n\nReplies are printed as JSON on stdout; logs go to stderr."
)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Run one dotnet command and print the JSON response
    Exec(ExecArgs),
    /// List installed SDKs
    Sdks {
        /// Bypass the cache
        #[arg(long)]
        refresh: bool,
    },
    /// Serve newline-delimited JSON requests on stdin
    Serve,
    /// Check configuration and the dotnet installation
    Doctor,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone)]
struct ExecArgs {
    /// Operation kind used for conflict detection (build, test, watch, ...)
    #[arg(long, default_value = "exec")]
    kind: String,
    /// Project or solution the operation works on. Defaults to --cwd.
    #[arg(long)]
    target: Option<String>,
    /// Working directory for the child process
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Cancel the command after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Arguments passed to dotnet
    #[arg(last = true, required = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv().ok();
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        generate_completions(*shell);
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load(cli.config.clone())?.resolve();
    logging::init(cli.verbose, &config.log_level);

    match cli.command.clone() {
        Commands::Exec(args) => run_exec(config, args).await,
        Commands::Sdks { refresh } => run_sdks(config, refresh).await,
        Commands::Serve => run_serve(config).await,
        Commands::Doctor => {
            run_doctor(&cli, config).await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render reply")?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{rendered}")?;
    Ok(())
}

fn exit_code_for(response: &CommandResponse) -> ExitCode {
    if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            token.cancel();
        }
    });
}

async fn run_exec(config: ResolvedConfig, args: ExecArgs) -> Result<ExitCode> {
    let service = BridgeService::new(config);

    let mut request = OperationRequest::new(OperationKind::parse(&args.kind), args.args);
    request.target = args.target;
    request.cwd = args.cwd;

    let interrupt = CancellationToken::new();
    cancel_on_ctrl_c(&interrupt);
    let cancel = service.deadline_token(&interrupt, args.timeout.map(Duration::from_secs));

    let response = service.execute(request, &cancel).await;
    cancel.cancel();
    print_json(&response)?;
    Ok(exit_code_for(&response))
}

async fn run_sdks(config: ResolvedConfig, refresh: bool) -> Result<ExitCode> {
    let service = BridgeService::new(config);
    let interrupt = CancellationToken::new();
    cancel_on_ctrl_c(&interrupt);
    match service.installed_sdks(refresh, &interrupt).await {
        Ok(cached) => {
            print_json(&*cached.value)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(response) => {
            print_json(&response)?;
            Ok(exit_code_for(&response))
        }
    }
}

async fn run_serve(config: ResolvedConfig) -> Result<ExitCode> {
    let service = Arc::new(BridgeService::new(config));
    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(&shutdown);

    tracing::info!("serving requests on stdin");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve::run(
        service,
        stdin,
        tokio::io::stdout(),
        shutdown,
        serve::DEFAULT_SWEEP_INTERVAL,
    )
    .await
    .context("Request loop failed")?;
    Ok(ExitCode::SUCCESS)
}

/// Run system diagnostics
async fn run_doctor(cli: &Cli, config: ResolvedConfig) {
    println!("{}", "dotnet-bridge doctor".bold());
    println!("{}", "====================".dimmed());
    println!();

    println!("{}", "Version Information:".bold());
    println!("  dotnet-bridge: {}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("{}", "Configuration:".bold());
    match cli.config.clone().or_else(config::default_config_path) {
        Some(path) if path.exists() => {
            println!("  {} config found at {}", "✓".green(), path.display());
        }
        Some(path) => println!(
            "  {} no config at {} (using defaults)",
            "!".yellow(),
            path.display()
        ),
        None => println!("  {} no config directory (using defaults)", "!".yellow()),
    }
    println!("  dotnet path: {}", config.dotnet_path);
    println!("  output budget: {} chars", config.max_output_chars);
    println!("  cache ttl: {}s", config.cache_ttl.as_secs());
    println!();

    println!("{}", "dotnet SDK:".bold());
    let service = BridgeService::new(config);
    let interrupt = CancellationToken::new();
    cancel_on_ctrl_c(&interrupt);
    match service.tool_version(true, &interrupt).await {
        Ok(version) => println!("  {} dotnet {}", "✓".green(), version.value),
        Err(response) => {
            let message = response
                .errors()
                .first()
                .map_or("unknown failure", |error| error.message.as_str());
            println!("  {} dotnet unavailable: {message}", "✗".red());
            return;
        }
    }
    match service.installed_sdks(true, &interrupt).await {
        Ok(sdks) if sdks.value.is_empty() => {
            println!("  {} no SDKs installed", "!".yellow());
        }
        Ok(sdks) => {
            for sdk in sdks.value.iter() {
                println!("  {} {} [{}]", "·".dimmed(), sdk.version, sdk.path);
            }
        }
        Err(_) => println!("  {} could not list SDKs", "✗".red()),
    }
}
