//! open123-cli: 123 Cloud from the command line
//!
//! Usage:
//!   open123-cli init --client-id ID --client-secret S --refresh-token T
//!   open123-cli ls [path]                 List a folder
//!   open123-cli put <local> [remote_dir]  Upload a file (resumable)
//!   open123-cli mv <path> <dir>           Move an entry
//!   open123-cli offline add <url>         Queue a remote download

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use open123::cloud_config::{default_config_path, ConfigStore, FileConfigStore};
use open123::offline::OfflineDownloadTool;
use open123::providers::{
    DriveType, LocalFileSource, Open123Config, Open123Provider, RemoteEntry, StorageProvider,
};

#[derive(Parser)]
#[command(
    name = "open123-cli",
    about = "open123-cli: 123 Cloud open-platform client",
    version,
    long_about = "Mount settings and tokens live in a JSON file per mount.\nRun `init` once, then use the other commands against the same --mount."
)]
struct Cli {
    /// Mount name (selects the config file)
    #[arg(long, global = true, default_value = "default")]
    mount: String,

    /// Explicit config file, overrides --mount
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or overwrite the mount config
    Init(InitArgs),
    #[command(flatten)]
    Mount(MountCommand),
}

#[derive(clap::Args)]
struct InitArgs {
    #[arg(long)]
    client_id: String,
    #[arg(long)]
    client_secret: String,
    #[arg(long)]
    refresh_token: String,
    /// Folder id used as "/"
    #[arg(long, default_value = "0")]
    root_folder_id: String,
    /// default, resource or backup
    #[arg(long, default_value = "resource")]
    drive: String,
    /// Folder receiving offline downloads
    #[arg(long)]
    offline_dir: Option<String>,
}

/// Commands that operate on a configured mount
#[derive(Subcommand)]
enum MountCommand {
    /// List a folder
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Upload a local file into a remote folder
    Put {
        local: PathBuf,
        #[arg(default_value = "/")]
        remote_dir: String,
    },
    /// Create a folder (and missing parents)
    Mkdir { path: String },
    /// Move an entry into another folder
    Mv { path: String, dir: String },
    /// Rename an entry in place
    Rename { path: String, name: String },
    /// Move an entry to the trash
    Rm { path: String },
    /// Print a download URL
    Link { path: String },
    /// Exchange the refresh token now
    Refresh,
    /// Offline (remote fetch) tasks
    Offline {
        #[command(subcommand)]
        action: OfflineAction,
    },
}

#[derive(Subcommand)]
enum OfflineAction {
    /// Queue a download by URL
    Add { url: String },
    /// Show task progress
    Status { task_id: String },
    /// Cancel a task
    Cancel { task_id: String },
}

fn parse_drive(name: &str) -> Result<DriveType> {
    match name.to_ascii_lowercase().as_str() {
        "default" => Ok(DriveType::Default),
        "resource" => Ok(DriveType::Resource),
        "backup" => Ok(DriveType::Backup),
        other => bail!("unknown drive type '{}' (expected default, resource or backup)", other),
    }
}

fn format_entry(entry: &RemoteEntry) -> String {
    let kind = if entry.is_dir { "d" } else { "-" };
    let modified = entry
        .modified
        .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{} {:>12} {} {:>12} {}", kind, entry.size, modified, entry.id, entry.name)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn,open123=info",
        1 => "info,open123=debug",
        _ => "trace",
    };
    open123::init_logging(level);

    let path = match cli.config {
        Some(ref path) => path.clone(),
        None => default_config_path(&cli.mount)?,
    };
    let store = Arc::new(FileConfigStore::new(path));

    match cli.command {
        Commands::Init(args) => init_mount(&store, args),
        Commands::Mount(command) => {
            let config = store
                .load()
                .with_context(|| format!("no usable config for mount '{}', run `init` first", cli.mount))?;
            let provider = Arc::new(Open123Provider::new(config, store.clone())?);
            run(command, provider).await
        }
    }
}

fn init_mount(store: &FileConfigStore, args: InitArgs) -> Result<()> {
    let mut config = Open123Config::new(&args.client_id, &args.client_secret);
    config.refresh_token = args.refresh_token;
    config.root_folder_id = args.root_folder_id;
    config.drive_type = parse_drive(&args.drive)?;
    config.offline_temp_dir = args.offline_dir;
    config.validate()?;
    store.save(&config)?;
    println!("Saved mount config to {}", store.path().display());
    Ok(())
}

async fn run(command: MountCommand, provider: Arc<Open123Provider>) -> Result<()> {
    match command {
        MountCommand::Ls { path } => {
            let dir = provider.stat(&path).await?;
            if !dir.is_dir {
                println!("{}", format_entry(&dir));
                return Ok(());
            }
            for entry in provider.list(&dir).await? {
                println!("{}", format_entry(&entry));
            }
        }
        MountCommand::Put { local, remote_dir } => {
            let source = LocalFileSource::open(&local).await?;
            let dir = provider.ensure_dir(&remote_dir).await?;

            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}%")
                    .context("progress template")?
                    .progress_chars("=> "),
            );
            bar.set_message(local.display().to_string());
            let progress_bar = bar.clone();
            let on_progress = move |percent: f64| progress_bar.set_position(percent.round() as u64);

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_ctrl_c.cancel();
                }
            });

            let entry = provider.put(&dir, &source, &on_progress, &cancel).await;
            bar.finish_and_clear();
            let entry = entry?;
            println!("Uploaded {} ({} bytes, id {})", entry.path, entry.size, entry.id);
        }
        MountCommand::Mkdir { path } => {
            let dir = provider.ensure_dir(&path).await?;
            println!("{} (id {})", dir.path, dir.id);
        }
        MountCommand::Mv { path, dir } => {
            let src = provider.stat(&path).await?;
            let dst = provider.stat(&dir).await?;
            if !dst.is_dir {
                bail!("{} is not a folder", dst.path);
            }
            let moved = provider.move_entry(&src, &dst).await?;
            println!("{} -> {}", src.path, moved.path);
        }
        MountCommand::Rename { path, name } => {
            let src = provider.stat(&path).await?;
            let renamed = provider.rename(&src, &name).await?;
            println!("{} -> {}", src.path, renamed.path);
        }
        MountCommand::Rm { path } => {
            let entry = provider.stat(&path).await?;
            provider.remove(&entry).await?;
            println!("Trashed {}", entry.path);
        }
        MountCommand::Link { path } => {
            let file = provider.stat(&path).await?;
            let link = provider.link(&file).await?;
            println!("{}", link.url);
        }
        MountCommand::Refresh => {
            provider.tokens().refresh().await?;
            println!("Token refreshed for {}", provider.display_name());
        }
        MountCommand::Offline { action } => {
            let tool = OfflineDownloadTool::new(provider.clone());
            if !tool.is_ready() {
                bail!("offline temp folder not set; run `init --offline-dir <path>`");
            }
            match action {
                OfflineAction::Add { url } => {
                    let id = tool.add_url(&url).await?;
                    println!("Task {}", id);
                }
                OfflineAction::Status { task_id } => {
                    let status = tool.status(&task_id).await?;
                    println!(
                        "{}: {:.1}% ({} bytes){}",
                        status.status,
                        status.progress,
                        status.total_bytes,
                        status.error.map(|e| format!(" error: {}", e)).unwrap_or_default()
                    );
                }
                OfflineAction::Cancel { task_id } => {
                    tool.remove(&task_id).await?;
                    println!("Cancelled task {}", task_id);
                }
            }
        }
    }
    Ok(())
}
