//! Fuzzermon - fuzz-testing results aggregator
//!
//! The main entry point, handling:
//! - The HTTP service (batch uploads, dashboard JSON, metrics)
//! - One-shot ingestion of a batch file from the command line
//! - Dashboard summaries and JSON schemas for the wire formats

use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use fm_common::{IngestOutcome, OutputFormat};
use fm_core::config::{
    load_config, validate_config, ConfigError, ConfigOptions, ConfigOverrides, FuzzermonConfig,
    ResolvedConfig,
};
use fm_core::exit_codes::ExitCode;
use fm_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use fm_core::server::{Server, ServerError};
use fm_core::store::{Store, StoreError};
use fm_core::{query, run_ingest, Batch};

/// Fuzzermon - collect and summarize fuzz-testing results
#[derive(Parser)]
#[command(name = "fuzzermon")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (overrides FUZZERMON_CONFIG and the XDG location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file (overrides storage.database)
    #[arg(long, global = true, env = "FUZZERMON_DB")]
    db: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve(ServeArgs),

    /// Ingest one batch document from a file or stdin
    Ingest(IngestArgs),

    /// Print the per-arch, per-host overview
    Summary,

    /// Print the JSON schema of a document format
    Schema(SchemaArgs),

    /// Validate configuration and database
    Check,

    /// Print version information
    Version,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Number of worker threads
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Batch document (`-` for stdin)
    file: PathBuf,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Which document to describe
    #[arg(value_enum)]
    target: SchemaTarget,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchemaTarget {
    /// Batch upload documents
    Batch,
    /// Upload responses
    Outcome,
    /// The configuration file
    Config,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version also arrive here and are not errors.
            let code = if e.use_stderr() {
                ExitCode::ArgsError
            } else {
                ExitCode::Clean
            };
            let _ = e.print();
            std::process::exit(code.as_i32());
        }
    };

    let resolved = load_config(&ConfigOptions {
        config_path: cli.global.config.clone(),
        config_dir: None,
    });

    let file_logging = resolved
        .as_ref()
        .ok()
        .map(|r| r.config.logging.clone());
    init_logging(&log_config(&cli.global, file_logging));

    let exit_code = match cli.command {
        Commands::Version => {
            print_version(&cli.global);
            ExitCode::Clean
        }
        Commands::Schema(args) => print_schema(args.target),
        command => match resolved {
            Ok(resolved) => run_command(&cli.global, command, resolved),
            Err(e) => output_config_error(&cli.global, &e),
        },
    };

    std::process::exit(exit_code.as_i32());
}

fn log_config(global: &GlobalOpts, file: Option<LogConfig>) -> LogConfig {
    let mut config = LogConfig::from_env(file, global.log_level, global.log_format);
    for _ in 0..global.verbose {
        config.level = config.level.louder();
    }
    if global.quiet {
        config.level = config.level.quieter();
    }
    config
}

fn run_command(global: &GlobalOpts, command: Commands, resolved: ResolvedConfig) -> ExitCode {
    let mut config = resolved.config;
    let mut overrides = ConfigOverrides {
        database: global.db.clone(),
        ..Default::default()
    };
    if let Commands::Serve(args) = &command {
        overrides.bind = args.bind.clone();
        overrides.port = args.port;
        overrides.workers = args.workers;
    }
    config.apply(&overrides);

    if let Err(e) = validate_config(&config) {
        return output_config_error(global, &ConfigError::from(e));
    }

    match command {
        Commands::Serve(_) => run_serve(global, &config),
        Commands::Ingest(args) => run_ingest_file(global, &config, &args),
        Commands::Summary => run_summary(global, &config),
        Commands::Check => run_check(global, &config, resolved.path, resolved.source),
        Commands::Schema(_) | Commands::Version => ExitCode::Clean,
    }
}

fn open_store(global: &GlobalOpts, config: &FuzzermonConfig) -> Result<Store, ExitCode> {
    Store::open(&config.storage.database, config.storage.busy_timeout())
        .map_err(|e| output_store_error(global, &e))
}

fn run_serve(global: &GlobalOpts, config: &FuzzermonConfig) -> ExitCode {
    let server = match Server::start(config) {
        Ok(server) => server,
        Err(e) => return output_server_error(global, &e),
    };

    if global.format == OutputFormat::Json {
        print_json(&serde_json::json!({
            "status": "listening",
            "addr": server.addr().to_string(),
            "database": config.storage.database.display().to_string(),
        }));
    } else {
        println!("listening on http://{}", server.addr());
    }

    server.wait();
    ExitCode::Clean
}

fn run_ingest_file(global: &GlobalOpts, config: &FuzzermonConfig, args: &IngestArgs) -> ExitCode {
    let raw = match read_input(&args.file) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("fuzzermon: cannot read {}: {}", args.file.display(), e);
            return ExitCode::IoError;
        }
    };

    let mut store = match open_store(global, config) {
        Ok(store) => store,
        Err(code) => return code,
    };

    let (outcome, code) = match run_ingest(&mut store, &raw) {
        Ok(_) => (IngestOutcome::Success, ExitCode::Clean),
        Err(failure) => (failure.outcome(), ExitCode::for_ingest_error(&failure.error)),
    };

    match global.format {
        OutputFormat::Json => print_json(&outcome),
        OutputFormat::Summary => match &outcome {
            IngestOutcome::Success => println!("success"),
            IngestOutcome::Failure { message } => println!("failure: {}", message),
        },
    }
    code
}

fn read_input(path: &Path) -> std::io::Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut raw = Vec::new();
        std::io::stdin().read_to_end(&mut raw)?;
        Ok(raw)
    } else {
        std::fs::read(path)
    }
}

fn run_summary(global: &GlobalOpts, config: &FuzzermonConfig) -> ExitCode {
    let store = match open_store(global, config) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let overview = match query::arch_overview(store.connection()) {
        Ok(overview) => overview,
        Err(e) => return output_store_error(global, &e),
    };

    match global.format {
        OutputFormat::Json => print_json(&overview),
        OutputFormat::Summary => {
            for block in &overview {
                println!("{}", block.arch.name);
                for host in &block.hosts {
                    let last = host
                        .last_batch_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "  {}: {} batches, {} failures, {} successes, last {}",
                        host.host.hostname, host.batch_count, host.num_failures, host.num_successes, last
                    );
                }
            }
        }
    }
    ExitCode::Clean
}

fn run_check(
    global: &GlobalOpts,
    config: &FuzzermonConfig,
    path: Option<PathBuf>,
    source: fm_core::config::ConfigSource,
) -> ExitCode {
    let mut results = vec![serde_json::json!({
        "check": "config",
        "status": "ok",
        "source": source,
        "path": path.as_ref().map(|p| p.display().to_string()),
    })];

    let mut exit_code = ExitCode::Clean;
    match Store::open(&config.storage.database, config.storage.busy_timeout()) {
        Ok(_) => results.push(serde_json::json!({
            "check": "database",
            "status": "ok",
            "path": config.storage.database.display().to_string(),
        })),
        Err(e) => {
            exit_code = ExitCode::StorageError;
            results.push(serde_json::json!({
                "check": "database",
                "status": "error",
                "path": config.storage.database.display().to_string(),
                "error": e.to_string(),
            }));
        }
    }

    match global.format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "status": if exit_code.is_success() { "ok" } else { "error" },
            "checks": results,
        })),
        OutputFormat::Summary => {
            for result in &results {
                println!(
                    "{}: {}",
                    result["check"].as_str().unwrap_or("?"),
                    result["status"].as_str().unwrap_or("?")
                );
            }
        }
    }
    exit_code
}

fn print_schema(target: SchemaTarget) -> ExitCode {
    let schema = match target {
        SchemaTarget::Batch => schemars::schema_for!(Batch),
        SchemaTarget::Outcome => schemars::schema_for!(IngestOutcome),
        SchemaTarget::Config => schemars::schema_for!(FuzzermonConfig),
    };
    print_json(&schema);
    ExitCode::Clean
}

fn print_version(global: &GlobalOpts) {
    match global.format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "fuzzermon_version": env!("CARGO_PKG_VERSION"),
            "rust_version": env!("CARGO_PKG_RUST_VERSION"),
            "schema_version": fm_core::store::SCHEMA_VERSION,
        })),
        OutputFormat::Summary => {
            println!("fuzzermon {}", env!("CARGO_PKG_VERSION"));
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("fuzzermon: failed to serialize output: {}", e),
    }
}

fn output_error(global: &GlobalOpts, kind: &str, message: &str, exit_code: ExitCode) -> ExitCode {
    match global.format {
        OutputFormat::Json => {
            let response = serde_json::json!({
                "status": "error",
                "error": {
                    "kind": kind,
                    "code": exit_code.code_name(),
                    "message": message,
                }
            });
            match serde_json::to_string_pretty(&response) {
                Ok(json) => eprintln!("{}", json),
                Err(_) => eprintln!("{} error: {}", kind, message),
            }
        }
        OutputFormat::Summary => eprintln!("{} error: {}", kind, message),
    }
    exit_code
}

fn output_config_error(global: &GlobalOpts, error: &ConfigError) -> ExitCode {
    let exit_code = match error {
        ConfigError::IoError { .. } => ExitCode::IoError,
        _ => ExitCode::ConfigError,
    };
    output_error(global, "config", &error.to_string(), exit_code)
}

fn output_store_error(global: &GlobalOpts, error: &StoreError) -> ExitCode {
    output_error(global, "storage", &error.to_string(), ExitCode::StorageError)
}

fn output_server_error(global: &GlobalOpts, error: &ServerError) -> ExitCode {
    let exit_code = match error {
        ServerError::Address(_) => ExitCode::ConfigError,
        ServerError::Bind { .. } | ServerError::Spawn(_) => ExitCode::IoError,
        ServerError::Store { .. } => ExitCode::StorageError,
        ServerError::Metrics(_) => ExitCode::InternalError,
    };
    output_error(global, "server", &error.to_string(), exit_code)
}
