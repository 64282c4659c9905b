//! testjail CLI - run and test programs in a reusable container.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use console::style;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use testjail::config::{self, Config, DEFAULT_CONFIG_FILE};
use testjail::diff::Strategy;
use testjail::discovery::{self, ExistingOutput};
use testjail::engine::docker::DockerEngine;
use testjail::pipeline::{Pipeline, PipelineOptions, TestCase};
use testjail::report::ConsoleReporter;
use testjail::session::{Language, Session, SessionError};

/// Exit status after Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser)]
#[command(name = "testjail")]
#[command(about = "Run C++ and Python programs against test inputs in a container", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by `run` and `test`.
#[derive(Args)]
struct ExecutionArgs {
    /// Source file (.cpp or .py)
    code: PathBuf,

    /// Input file or directory of inputs
    #[arg(short, long)]
    input: PathBuf,

    /// Time limit per input, in seconds
    #[arg(short, long)]
    time_limit: Option<f64>,

    /// Extension of input files when the input is a directory
    #[arg(long, default_value = ".in")]
    input_ext: String,

    /// Only list cases that did not pass
    #[arg(long)]
    hide_success: bool,

    /// Number of inputs uploaded per batch
    #[arg(long)]
    chunk: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program and save its outputs
    Run {
        #[command(flatten)]
        exec: ExecutionArgs,

        /// Output file, or directory when the input is a directory
        #[arg(short, long)]
        output: PathBuf,

        /// Write over existing outputs
        #[arg(long, conflicts_with = "clear")]
        overwrite: bool,

        /// Delete the output location before running
        #[arg(long)]
        clear: bool,
    },

    /// Run a program and compare its outputs with expected ones
    Test {
        #[command(flatten)]
        exec: ExecutionArgs,

        /// Expected output file, or directory of expected outputs
        #[arg(short, long)]
        output: PathBuf,

        /// Extension of expected output files
        #[arg(long, default_value = ".out")]
        output_ext: String,

        /// Compare lines by position instead of aligning them
        #[arg(long)]
        line_by_line: bool,
    },

    /// Check that the Docker daemon is reachable
    Ping,

    /// Manage the runner image
    Image {
        #[command(subcommand)]
        action: ImageAction,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[derive(Subcommand)]
enum ImageAction {
    /// Show whether the runner image is present
    Status,
    /// Pull the runner image
    Pull,
    /// Remove the runner image
    Remove,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Progress output goes to stdout; keep logs on stderr and quiet by default.
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let code = match cli.command {
        Commands::Run {
            exec,
            output,
            overwrite,
            clear,
        } => {
            let existing = if clear {
                ExistingOutput::Clear
            } else if overwrite {
                ExistingOutput::Overwrite
            } else {
                ExistingOutput::Fail
            };
            run_code(&cli.config, exec, &output, existing).await?
        }
        Commands::Test {
            exec,
            output,
            output_ext,
            line_by_line,
        } => test_code(&cli.config, exec, &output, &output_ext, line_by_line).await?,
        Commands::Ping => ping(&cli.config).await?,
        Commands::Image { action } => manage_image(&cli.config, action).await?,
        Commands::Validate => validate_config(&cli.config)?,
        Commands::Init => init_config(&cli.config)?,
    };

    std::process::exit(code);
}

fn docker_session(config: &Config) -> Result<Session<DockerEngine>> {
    let engine = DockerEngine::new(config.runner.docker_host.as_deref())
        .context("Failed to connect to Docker")?;
    Ok(Session::new(engine, config.runner.image.clone()))
}

/// Code read from disk together with its extension.
struct Source {
    bytes: Vec<u8>,
    extension: String,
}

async fn read_source(path: &Path) -> Result<Source> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    if Language::from_extension(&extension).is_none() {
        bail!(
            "Unsupported code file {}: expected a .cpp or .py file",
            path.display()
        );
    }

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read code file: {}", path.display()))?;
    Ok(Source { bytes, extension })
}

async fn run_code(
    config_path: &Path,
    exec: ExecutionArgs,
    output: &Path,
    existing: ExistingOutput,
) -> Result<i32> {
    let config = config::load_config_or_default(config_path)?;
    let source = read_source(&exec.code).await?;
    let cases = discovery::run_cases(&exec.input, output, &exec.input_ext, existing)?;

    let strategy = config.compare.strategy;
    execute(&config, &exec, source, cases, strategy).await
}

async fn test_code(
    config_path: &Path,
    exec: ExecutionArgs,
    expected: &Path,
    output_ext: &str,
    line_by_line: bool,
) -> Result<i32> {
    let config = config::load_config_or_default(config_path)?;
    let source = read_source(&exec.code).await?;
    let pairing = discovery::test_cases(&exec.input, expected, &exec.input_ext, output_ext)?;
    if !pairing.unmatched.is_empty() {
        eprintln!(
            "{} {} inputs have no expected output and were skipped",
            style("warning:").yellow().bold(),
            pairing.unmatched.len()
        );
    }

    let strategy = if line_by_line {
        Strategy::LineByLine
    } else {
        config.compare.strategy
    };
    execute(&config, &exec, source, pairing.cases, strategy).await
}

async fn execute(
    config: &Config,
    exec: &ExecutionArgs,
    source: Source,
    cases: Vec<TestCase>,
    strategy: Strategy,
) -> Result<i32> {
    let time_limit = exec.time_limit.unwrap_or(config.runner.time_limit_secs);
    let options = PipelineOptions {
        chunk_size: exec.chunk.unwrap_or(config.pipeline.chunk_size),
        timeout_secs: time_limit,
    };

    let session = docker_session(config)?;
    if !session.ping().await {
        bail!("Docker daemon is not reachable. Is Docker running?");
    }
    session
        .pull_image()
        .await
        .with_context(|| format!("Failed to pull image {}", session.image()))?;
    session.start().await.context("Failed to start container")?;
    info!("Running {} cases", cases.len());

    let hide_success = exec.hide_success || config.compare.hide_success;
    let reporter = ConsoleReporter::new(time_limit, strategy).hide_success(hide_success);
    let (outcome, interrupted) = tokio::select! {
        result = run_cases(&session, source, &cases, options, &reporter) => (result, false),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", style("Interrupted, stopping container").yellow());
            (Ok(INTERRUPTED_EXIT_CODE), true)
        }
    };

    // Runs already written would still be served by a cooperative stop.
    let teardown = if interrupted {
        session.kill().await
    } else {
        session.stop().await
    };
    if let Err(e) = teardown {
        warn!("Failed to stop container: {}", e);
    }
    outcome
}

async fn run_cases(
    session: &Session<DockerEngine>,
    source: Source,
    cases: &[TestCase],
    options: PipelineOptions,
    reporter: &ConsoleReporter,
) -> Result<i32> {
    match session.send_code(&source.bytes, &source.extension).await {
        Ok(()) => {}
        Err(SessionError::CompileFailure { exit_code, stderr }) => {
            eprintln!(
                "{}",
                style(format!("Compilation failed (exit code {})", exit_code))
                    .red()
                    .bold()
            );
            eprintln!("{}", stderr.trim_end());
            return Ok(1);
        }
        Err(e) => return Err(e).context("Failed to send code"),
    }

    let summary = Pipeline::new(session, reporter, options).run(cases).await;
    Ok(summary.exit_code())
}

async fn ping(config_path: &Path) -> Result<i32> {
    let config = config::load_config_or_default(config_path)?;
    let session = docker_session(&config)?;
    if session.ping().await {
        println!("{}", style("Docker is running").green());
        Ok(0)
    } else {
        println!("{}", style("Docker is not reachable").red());
        Ok(1)
    }
}

async fn manage_image(config_path: &Path, action: ImageAction) -> Result<i32> {
    let config = config::load_config_or_default(config_path)?;
    let session = docker_session(&config)?;
    let image = session.image().to_string();

    match action {
        ImageAction::Status => {
            if session.is_image_pulled().await? {
                println!("Image {} is pulled", style(&image).bold());
            } else {
                println!("Image {} is not pulled", style(&image).bold());
            }
        }
        ImageAction::Pull => {
            let spinner = indicatif::ProgressBar::new_spinner();
            spinner.set_message(format!("Pulling {}", image));
            spinner.enable_steady_tick(std::time::Duration::from_millis(100));
            let result = session.pull_image().await;
            spinner.finish_and_clear();
            result.with_context(|| format!("Failed to pull image {}", image))?;
            println!("Image {} is pulled", style(&image).bold());
        }
        ImageAction::Remove => {
            session
                .remove_image()
                .await
                .with_context(|| format!("Failed to remove image {}", image))?;
            println!("Image {} is removed", style(&image).bold());
        }
    }
    Ok(0)
}

fn validate_config(config_path: &Path) -> Result<i32> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Image: {}", config.runner.image);
            println!(
                "  Docker host: {}",
                config.runner.docker_host.as_deref().unwrap_or("(local)")
            );
            println!("  Time limit: {}s", config.runner.time_limit_secs);
            println!("  Chunk size: {}", config.pipeline.chunk_size);
            let strategy = match config.compare.strategy {
                Strategy::Lcs => "lcs",
                Strategy::LineByLine => "line-by-line",
            };
            println!("  Strategy: {}", strategy);
            Ok(0)
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            Ok(1)
        }
    }
}

fn init_config(config_path: &Path) -> Result<i32> {
    if config_path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            config_path.display()
        );
        return Ok(1);
    }

    let body = toml::to_string_pretty(&Config::default()).context("Failed to render config")?;
    std::fs::write(config_path, format!("# testjail configuration file\n\n{}", body))
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Created {}", config_path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  testjail test <code> -i <inputs> -o <expected>");

    Ok(0)
}
