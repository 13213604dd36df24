use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use streamglob::config::AppConfig;
use streamglob::database::{self, CatalogRepository, SqlxCatalogRepository};
use streamglob::logging::init_logging;
use streamglob::manager::{TaskHandle, TaskManager, TaskReport};
use streamglob::program::ConfigProgramResolver;
use streamglob::provider::{ProviderRegistry, URL_PROVIDER_ID, persist_listing};
use streamglob::recorder::CompletionRecorder;
use streamglob::task::TaskOptions;

#[derive(Debug, Parser)]
#[command(name = "streamglob", version, about = "Play and download media streams")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, env = "STREAMGLOB_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `streamglob=debug,sqlx=warn`.
    #[arg(long, global = true, env = "STREAMGLOB_LOG")]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Play one or more URLs in the preview player.
    Play {
        #[arg(required = true)]
        urls: Vec<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        player: Option<String>,
    },
    /// Download URLs, one task per URL.
    Download {
        #[arg(required = true)]
        urls: Vec<String>,
        #[arg(long)]
        title: Option<String>,
        /// Only download the URL at this 0-based position.
        #[arg(long)]
        index: Option<usize>,
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Postprocessor to run after the download; repeat to chain.
        #[arg(long = "postprocessor")]
        postprocessors: Vec<String>,
        /// Output filename template.
        #[arg(long)]
        template: Option<String>,
    },
    /// Look for a previous download of a URL.
    Downloaded {
        url: String,
        #[arg(long)]
        title: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    let (logging, _guard) = init_logging(&config.log_dir)?;
    if let Some(directive) = &cli.log_filter {
        logging.set_filter(directive)?;
    }
    debug!(filter = %logging.get_filter(), log_dir = %logging.log_dir().display(), "Logging ready");
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    let registry = ProviderRegistry::with_builtin(&config);
    let provider = registry.get(URL_PROVIDER_ID)?;

    if let Command::Downloaded { url, title } = &cli.command {
        let listing = provider.listing(title.as_deref().unwrap_or(""), std::slice::from_ref(url))?;
        let found = provider
            .find_downloaded(&listing, None, &TaskOptions::default())
            .await?;
        shutdown.cancel();
        return Ok(match found.into_iter().next().flatten() {
            Some(path) => {
                println!("{}", path.display());
                ExitCode::SUCCESS
            }
            None => {
                println!("not downloaded: {}", url);
                ExitCode::FAILURE
            }
        });
    }

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    let catalog: Arc<dyn CatalogRepository> = Arc::new(SqlxCatalogRepository::new(pool));

    let manager = TaskManager::new(
        (&config.tasks).into(),
        Arc::new(ConfigProgramResolver::new(&config.programs)),
        Arc::new(CompletionRecorder::new(catalog.clone())),
    );

    let reports = match cli.command {
        Command::Play {
            urls,
            title,
            player,
        } => {
            let listing = provider.listing(title.as_deref().unwrap_or(""), &urls)?;
            let listing = persist_listing(catalog.as_ref(), listing).await?;
            let options = TaskOptions {
                player,
                ..Default::default()
            };
            let task = provider.create_play_task(&listing, options)?;
            let handle = manager.play(task)?;
            wait_all(&manager, vec![handle]).await
        }
        Command::Download {
            urls,
            title,
            index,
            max_concurrent,
            postprocessors,
            template,
        } => {
            if let Some(max) = max_concurrent {
                manager.set_max_concurrent(max);
            }
            let listing = provider.listing(title.as_deref().unwrap_or(""), &urls)?;
            let listing = persist_listing(catalog.as_ref(), listing).await?;
            let options = TaskOptions {
                postprocessors,
                template,
                ..Default::default()
            };
            let tasks = provider.create_download_tasks(&listing, index, options)?;
            let handles = tasks
                .into_iter()
                .map(|task| manager.download(task))
                .collect::<streamglob::Result<Vec<_>>>()?;
            wait_all(&manager, handles).await
        }
        Command::Downloaded { .. } => Vec::new(),
    };

    manager.shutdown().await;
    shutdown.cancel();

    let mut ok = true;
    for report in &reports {
        print_report(report);
        ok &= report.is_success();
    }
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Wait for every handle; Ctrl-C cancels whatever is still running.
async fn wait_all(manager: &TaskManager, handles: Vec<TaskHandle>) -> Vec<TaskReport> {
    let waiting = join_all(handles.iter().map(|h| h.wait()));
    tokio::select! {
        reports = waiting => reports,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling tasks");
            for handle in &handles {
                manager.cancel(handle.id());
            }
            join_all(handles.iter().map(|h| h.wait())).await
        }
    }
}

fn print_report(report: &TaskReport) {
    info!(task_id = %report.id, outcome = %report.outcome, "Task report");
    match &report.destination {
        Some(destination) => println!(
            "{}\t{}\t{}",
            report.title,
            report.outcome,
            destination.display()
        ),
        None => println!("{}\t{}", report.title, report.outcome),
    }
    if report.bookkeeping.is_lost() {
        println!("{}\tcatalog not updated: {:?}", report.title, report.bookkeeping);
    }
}
