mod commands;
mod pool;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use commands::{
    ArchiveWalCommand, CreateBackupCommand, DeleteBackupCommand, ListBackupsCommand,
    RestoreBackupCommand, RestoreWalCommand,
};
use pgferry_backends::{S3Storage, Storage};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "pgferry",
    about = "PostgreSQL continuous archiving and point-in-time recovery",
    long_about = "pgferry streams base backups and WAL segments of a PostgreSQL \
                  cluster to S3, and restores them for point-in-time recovery"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List all available backups")]
    ListBackups(ListBackupsCommand),

    #[command(about = "Create a new base backup, storing it on S3")]
    CreateBackup(CreateBackupCommand),

    #[command(about = "Restore a base backup from S3")]
    RestoreBackup(RestoreBackupCommand),

    #[command(about = "Delete a backup and everything it contains")]
    DeleteBackup(DeleteBackupCommand),

    #[command(about = "Compress and archive a WAL segment (archive_command)")]
    ArchiveWal(ArchiveWalCommand),

    #[command(about = "Fetch and decompress a WAL segment (restore_command)")]
    RestoreWal(RestoreWalCommand),
}

impl Commands {
    fn common(&self) -> &CommonOpts {
        match self {
            Commands::ListBackups(cmd) => &cmd.common,
            Commands::CreateBackup(cmd) => &cmd.common,
            Commands::RestoreBackup(cmd) => &cmd.common,
            Commands::DeleteBackup(cmd) => &cmd.common,
            Commands::ArchiveWal(cmd) => &cmd.common,
            Commands::RestoreWal(cmd) => &cmd.common,
        }
    }
}

#[derive(Args)]
pub struct CommonOpts {
    #[arg(long, help = "S3 bucket where to push/fetch backups to/from")]
    pub s3_bucket: String,

    #[arg(long, default_value = "us-east-1", help = "AWS region where the S3 bucket lives in")]
    pub s3_region: String,

    #[arg(long, default_value_t = 3, help = "Maximum number of attempts at connecting to S3")]
    pub s3_max_retries: u32,

    #[arg(long, default_value_t = 1, help = "Number of concurrent jobs")]
    pub workers: usize,

    #[arg(long, default_value = "/tmp", help = "Directory to use for temporary files")]
    pub tmp: PathBuf,

    #[arg(long, help = "Verbose output")]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let common = cli.command.common();

    init_tracing(common.verbose);

    let storage: Arc<dyn Storage> = Arc::new(
        S3Storage::new(
            common.s3_bucket.clone(),
            common.s3_region.clone(),
            common.s3_max_retries,
        )
        .await,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, draining in-flight work");
                cancel.cancel();
            }
        });
    }

    match &cli.command {
        Commands::ListBackups(cmd) => cmd.run(storage).await,
        Commands::CreateBackup(cmd) => cmd.run(storage, cancel).await,
        Commands::RestoreBackup(cmd) => cmd.run(storage).await,
        Commands::DeleteBackup(cmd) => cmd.run(storage).await,
        Commands::ArchiveWal(cmd) => cmd.run(storage).await,
        Commands::RestoreWal(cmd) => cmd.run(storage).await,
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "pgferry={level},pgferry_core={level},pgferry_backends={level},pgferry_postgres={level}"
        )))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default subscriber failed");
}
