//! sealed-sql CLI - encrypted SQL databases behind a worker
//!
//! Usage:
//!   sealed-sql worker [--storage-dir <dir>]
//!   sealed-sql keygen
//!   sealed-sql exec <sql> [--identifier <name>] [--storage-dir <dir>]
//!   sealed-sql wipe <identifier> [--storage-dir <dir>]
//!
//! Examples:
//!   SEALED_SQL_KEY=$(sealed-sql keygen) sealed-sql exec "CREATE TABLE t(x)" -i notes
//!   sealed-sql exec "SELECT * FROM t" -i notes --config ./sealed-sql.toml
//!   sealed-sql wipe notes

use clap::{Parser, Subcommand};
use sealed_sql::client::Database;
use sealed_sql::config::Settings;
use sealed_sql::crypto;
use sealed_sql::storage::{DiskStorage, Storage};
use sealed_sql::worker;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sealed-sql")]
#[command(about = "sealed-sql - An encrypted embedded SQL engine driven through an isolated worker")]
#[command(version)]
struct Cli {
    /// Path to a config file (defaults to the usual search locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve calls as NDJSON over stdin/stdout
    Worker {
        /// Mount root for database files
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },

    /// Print a fresh random key
    Keygen,

    /// Run SQL against a database and print the results as JSON
    Exec {
        /// SQL to run; may contain several statements
        sql: String,

        /// Database identifier (defaults to the configured one, then "default")
        #[arg(short, long)]
        identifier: Option<String>,

        /// Mount root for database files
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },

    /// Delete a database file
    Wipe {
        /// Database identifier
        identifier: String,

        /// Mount root for database files
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let mut settings = match load_settings(cli.config.as_ref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Worker { storage_dir } => {
            override_storage_dir(&mut settings, storage_dir);
            cmd_worker(&settings)
        }
        Commands::Keygen => cmd_keygen(),
        Commands::Exec {
            sql,
            identifier,
            storage_dir,
        } => {
            override_storage_dir(&mut settings, storage_dir);
            cmd_exec(&settings, &sql, identifier)
        }
        Commands::Wipe {
            identifier,
            storage_dir,
        } => {
            override_storage_dir(&mut settings, storage_dir);
            cmd_wipe(&settings, &identifier)
        }
    }
}

/// Logs go to stderr; stdout carries worker frames.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings, sealed_sql::config::SettingsError> {
    match path {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    }
}

fn override_storage_dir(settings: &mut Settings, dir: Option<PathBuf>) {
    if let Some(dir) = dir {
        settings.storage.dir = Some(dir.display().to_string());
    }
}

fn block_on<F: Future>(future: F) -> Result<F::Output, std::io::Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

fn storage_for(settings: &Settings) -> Result<Arc<dyn Storage>, sealed_sql::config::SettingsError> {
    Ok(match settings.storage_dir()? {
        Some(dir) => Arc::new(DiskStorage::with_default_root(dir)),
        None => Arc::new(DiskStorage::new()),
    })
}

fn cmd_worker(settings: &Settings) -> ExitCode {
    let storage = match storage_for(settings) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match block_on(worker::serve_stdio(storage)) {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) | Err(e) => {
            eprintln!("Worker error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_keygen() -> ExitCode {
    match crypto::generate_encoded_key() {
        Ok(key) => {
            println!("{}", key);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_exec(settings: &Settings, sql: &str, identifier: Option<String>) -> ExitCode {
    let options = match settings.connection_options() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if !options.has_key() {
        eprintln!("Error: no key configured. Set connection.key or SEALED_SQL_KEY.");
        return ExitCode::FAILURE;
    }
    let identifier = identifier.or_else(|| settings.connection.identifier.clone());

    let result = block_on(async {
        let db = Database::connect(settings).await?;
        db.mount(&options, identifier.as_deref(), None).await?;
        let results = db.execute(sql).await;
        db.close(true).await?;
        results
    });

    match result {
        Ok(Ok(results)) => match serde_json::to_string_pretty(&results) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error encoding results: {}", e);
                ExitCode::FAILURE
            }
        },
        Ok(Err(e)) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_wipe(settings: &Settings, identifier: &str) -> ExitCode {
    let result = block_on(async {
        let db = Database::connect(settings).await?;
        db.wipe(identifier, None).await
    });

    match result {
        Ok(Ok(())) => {
            println!("Wiped {}", identifier);
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            ExitCode::FAILURE
        }
    }
}
