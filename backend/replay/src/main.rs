use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use records::FormKind;
use server::{
    cache::SubmissionCache,
    client::{RemoteClient, TableAnalytics},
    config::Config,
    retry::Retrier,
    state::{init_persistence, init_storage},
};
use tokio::signal::ctrl_c;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every cached submission of one form.
    List { kind: FormKind },

    /// Persisted submission counters.
    Stats,

    /// Send failed submissions again.
    Resubmit { kind: FormKind },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let config = Config::load().context("loading configuration")?;
    let storage = init_storage(&config).await.context("opening cache storage")?;
    let cache = SubmissionCache::new(storage, config.namespace.clone());
    cache.load().await.context("reading cache")?;

    match args.command {
        Command::List { kind } => {
            for record in cache.list(kind).await {
                println!("{}", replay::describe(&record));
            }
        }
        Command::Stats => {
            let counts = cache.counts().await;
            println!("Beta: {}", counts.beta);
            let profiles = counts.profiles;
            println!(
                "  developer {}, recruiter {}, both {}, other {}",
                profiles.developer, profiles.recruiter, profiles.both, profiles.other
            );
            println!("Contact: {}", counts.contact);
            println!("Total: {}", counts.total);
        }
        Command::Resubmit { kind } => {
            let persistence = init_persistence(&config)?;
            let client = RemoteClient::new(
                persistence.clone(),
                Arc::new(TableAnalytics::new(persistence)),
            );
            let retrier = Retrier::new(Arc::new(client), config.retry.clone());

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing current submission");
                    trigger.cancel();
                }
            });

            let pending = replay::pending_replays(&cache.list(kind).await).len();
            let pb = ProgressBar::new(pending as u64);
            pb.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )?
                .progress_chars("=> "),
            );

            let summary = replay::resubmit(&cache, &retrier, kind, &cancel, &pb).await?;
            pb.finish_with_message("Done");

            info!(?summary, "Resubmission finished");
            println!("Replayed: {}", summary.replayed);
            println!("Duplicates: {}", summary.duplicates);
            println!("Still failing: {}", summary.failed);
        }
    }

    Ok(())
}
