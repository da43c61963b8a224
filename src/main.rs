use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use archive_importer::config::ImportConfig;
use archive_importer::{
    ImportError, ImportOptions, ImportSummary, MemoryStore, PgStore, Store, import_emlx,
    import_mbox, init_logger,
};

#[derive(Parser, Debug)]
#[command(
    name = "archive-importer",
    about = "Import mbox files and Apple Mail directories into the message store"
)]
struct Cli {
    /// Keep everything in memory instead of connecting to DATABASE_URL.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one or more mbox files.
    ImportMbox {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        common: CommonArgs,

        /// Do not strip one `>` from `>From ` body lines.
        #[arg(long)]
        no_unescape: bool,

        /// Continue with the next file after a file whose run failed.
        #[arg(long)]
        keep_going: bool,
    },
    /// Import every mailbox under an Apple Mail directory.
    ImportEmlx {
        root: PathBuf,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Account address the archive belongs to.
    #[arg(long)]
    identifier: String,

    /// Source type recorded for the account.
    #[arg(long)]
    source_type: Option<String>,

    /// Label applied to every imported message.
    #[arg(long)]
    label: Option<String>,

    /// Ignore an interrupted run and start over.
    #[arg(long)]
    no_resume: bool,

    /// Where attachment files are written.
    #[arg(long)]
    attachments_dir: Option<PathBuf>,

    /// Persist progress every N messages.
    #[arg(long)]
    checkpoint_interval: Option<usize>,

    /// Largest single message accepted, in bytes.
    #[arg(long)]
    max_message_bytes: Option<u64>,
}

impl CommonArgs {
    fn options(&self, config: &ImportConfig) -> ImportOptions {
        let mut options = ImportOptions::from_config(&self.identifier, config);
        options.source_type = self.source_type.clone();
        options.label = self.label.clone();
        options.no_resume = self.no_resume;
        if let Some(dir) = &self.attachments_dir {
            options.attachments_dir = dir.clone();
        }
        if let Some(interval) = self.checkpoint_interval {
            options.checkpoint_interval = interval;
        }
        if let Some(limit) = self.max_message_bytes {
            options.max_message_bytes = limit;
        }
        options
    }
}

async fn connect_store(dry_run: bool) -> Result<Box<dyn Store>, Box<dyn std::error::Error>> {
    if dry_run {
        log::info!("dry run: using in-memory store");
        return Ok(Box::new(MemoryStore::new()));
    }

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| "DATABASE_URL must be set (or pass --dry-run)")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await?;
    let store = PgStore::new(pool);
    store.migrate().await?;
    log::info!("database migrations successful");
    Ok(Box::new(store))
}

fn report(target: &str, result: &Result<ImportSummary, ImportError>) -> bool {
    match result {
        Ok(summary) => {
            println!("{}: {}", target, summary);
            !summary.failed()
        }
        Err(err) => {
            eprintln!("error: {}: {}", target, err);
            false
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logger();
    let cli = Cli::parse();

    let store = match connect_store(cli.dry_run).await {
        Ok(store) => store,
        Err(err) => {
            eprintln!("error: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, stopping after the current message");
            signal_token.cancel();
        }
    });

    let config = ImportConfig::from_env();
    let mut ok = true;

    match cli.command {
        Command::ImportMbox {
            files,
            common,
            no_unescape,
            keep_going,
        } => {
            let mut options = common.options(&config);
            if no_unescape {
                options.unescape_from = false;
            }
            for file in &files {
                let result = import_mbox(store.as_ref(), file, &options, &cancel).await;
                let succeeded = report(&file.display().to_string(), &result);
                ok &= succeeded;
                if cancel.is_cancelled() {
                    break;
                }
                if !succeeded && !keep_going {
                    break;
                }
            }
        }
        Command::ImportEmlx { root, common } => {
            let options = common.options(&config);
            let result = import_emlx(store.as_ref(), &root, &options, &cancel).await;
            ok = report(&root.display().to_string(), &result);
        }
    }

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
