use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Args;
use discoball::{
    ledger::EventSource,
    replicate::Replicator,
    trust::{self, TrustError, TrustSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;

#[derive(Args, Debug, Clone)]
pub(crate) struct PartyArgs {
    /// File with the addresses of the publishers you trust, one per line.
    #[clap(long, default_value = trust::DEFAULT_FILE)]
    pub(crate) friends_file: PathBuf,
    /// Write a sample friends file and exit.
    #[clap(long)]
    pub(crate) create_sample: bool,
    /// Print store statistics and exit.
    #[clap(long, conflicts_with = "create_sample")]
    pub(crate) stats: bool,
}

impl PartyArgs {
    pub(crate) async fn run(self, config: &Config) -> Result<ExitCode> {
        if self.create_sample {
            trust::write_sample(&self.friends_file).await?;
            println!("Created {}", self.friends_file.display());
            println!("Add your friends' addresses to it and run `discoball party` again.");
            return Ok(ExitCode::SUCCESS);
        }
        if self.stats {
            super::print_stats(&config.store()?).await?;
            return Ok(ExitCode::SUCCESS);
        }

        let trust = match TrustSet::load(&self.friends_file).await {
            Ok(trust) => trust,
            Err(err @ TrustError::NotFound(_)) => {
                eprintln!("{err}");
                eprintln!("Create one with `discoball party --create-sample`.");
                return Ok(ExitCode::FAILURE);
            }
            Err(err) => return Err(err.into()),
        };
        if trust.is_empty() {
            println!(
                "No trusted publishers in {}, nothing to do.",
                self.friends_file.display()
            );
            return Ok(ExitCode::SUCCESS);
        }
        println!("Partying with {} friends", trust.len());

        let ledger = config.ledger()?;
        let head = ledger.head().await.context("registry unavailable")?;
        debug!(head, "registry reachable");
        let mut replicator = Replicator::new(ledger, config.store()?, config.replication.clone());
        let cancel = CancellationToken::new();
        let ctrl_c = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, finishing the current entry");
                    cancel.cancel();
                }
            }
        });
        let report = replicator.run(&trust, &cancel).await;
        ctrl_c.abort();
        let report = report?;

        print!("{report}");
        if report.is_success() {
            super::print_stats(replicator.store()).await?;
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::FAILURE)
        }
    }
}
