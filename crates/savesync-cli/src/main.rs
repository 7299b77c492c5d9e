mod config;
mod serve_cmd;
mod transform_cmd;
mod upload_cmd;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use config::{CliOverrides, SavesyncConfig};

#[derive(Parser)]
#[command(name = "savesync", about = "Worker-isolated save compression, upload and live ingestion")]
struct Cli {
    /// Server base URL (overrides SAVESYNC_SERVER_URL env var)
    #[arg(long, global = true)]
    server_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a savesync config file
    Init {
        /// Directory the server stores artifacts in
        #[arg(long)]
        storage_dir: Option<PathBuf>,
        /// Remote validation endpoint used by `savesync serve`
        #[arg(long)]
        validator_url: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the ingestion server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// Directory the server stores artifacts in
        #[arg(long)]
        storage_dir: Option<PathBuf>,
        /// Remote validation endpoint
        #[arg(long)]
        validator_url: Option<String>,
    },
    /// Compress a save file and upload it
    Upload {
        /// Save file to upload
        file: PathBuf,
        /// Subject (e.g. user id) the save belongs to
        #[arg(long)]
        subject: String,
    },
    /// Re-emit a stored artifact, decoding zstd
    Transform {
        /// Stored artifact to read
        input: PathBuf,
        /// Where to write the result
        output: PathBuf,
    },
}

/// Execute the `savesync init` command: write config file.
fn cmd_init(
    server_url: Option<&str>,
    storage_dir: Option<&Path>,
    validator_url: Option<&str>,
    force: bool,
) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let storage_dir = storage_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_storage_dir);
    let cfg = config::ConfigFile {
        server: config::ServerSection {
            url: Some(server_url.unwrap_or(config::DEFAULT_SERVER_URL).to_string()),
        },
        storage: config::StorageSection {
            dir: Some(storage_dir.clone()),
        },
        validation: config::ValidationSection {
            url: validator_url.map(str::to_string),
        },
        compression: config::CompressionSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  server.url = {}", cfg.server.url.as_deref().unwrap_or_default());
    println!("  storage.dir = {}", storage_dir.display());
    match validator_url {
        Some(url) => println!("  validation.url = {url}"),
        None => {
            println!();
            println!("Next: set validation.url (or SAVESYNC_VALIDATOR_URL) before running `savesync serve`.");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            storage_dir,
            validator_url,
            force,
        } => {
            cmd_init(
                cli.server_url.as_deref(),
                storage_dir.as_deref(),
                validator_url.as_deref(),
                force,
            )?;
        }
        Commands::Serve {
            bind,
            port,
            storage_dir,
            validator_url,
        } => {
            let resolved = SavesyncConfig::resolve(&CliOverrides {
                server_url: cli.server_url.as_deref(),
                storage_dir: storage_dir.as_deref(),
                validator_url: validator_url.as_deref(),
            });
            serve_cmd::run_serve(&resolved, &bind, port).await?;
        }
        Commands::Upload { file, subject } => {
            let resolved = SavesyncConfig::resolve(&CliOverrides {
                server_url: cli.server_url.as_deref(),
                ..CliOverrides::default()
            });
            upload_cmd::run_upload(&resolved, &file, &subject).await?;
        }
        Commands::Transform { input, output } => {
            let resolved = SavesyncConfig::resolve(&CliOverrides::default());
            transform_cmd::run_transform(resolved.zstd_loader(), &input, &output).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test_util {
    use std::sync::{Mutex, MutexGuard, PoisonError};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Serialise tests that mutate process environment variables.
    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
