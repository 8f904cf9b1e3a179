use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Args;
use discoball::{
    crawl::HttpCrawler,
    dns::{self, DnsResolver},
    publish::{PublishError, PublishPipeline},
    signer::SecretKey,
};

use crate::config::Config;

#[derive(Args, Debug, Clone)]
pub(crate) struct DanceArgs {
    /// Domain to mirror, e.g. example.com.
    #[clap(long)]
    pub(crate) domain: String,
    /// Path to mirror, e.g. /page.
    #[clap(long)]
    pub(crate) path: String,
    /// Hex encoded private key of the publishing account.
    #[clap(long)]
    pub(crate) private_key: String,
}

impl DanceArgs {
    pub(crate) async fn run(self, config: &Config) -> Result<ExitCode> {
        let key: SecretKey = self
            .private_key
            .parse()
            .context("invalid --private-key")?;
        let publisher = key.address();
        let pipeline = PublishPipeline::new(
            DnsResolver::new(config.timeouts.dns),
            HttpCrawler::new(config.timeouts.crawl)?,
            config.store()?,
            config.ledger()?.with_signer(key),
        );

        println!("Mirroring {}{} as {publisher}", self.domain, self.path);
        match pipeline.publish(&publisher, &self.domain, &self.path).await {
            Ok(published) => {
                println!(
                    "Successfully mirrored {}{}",
                    published.domain, published.path
                );
                println!("  content: {}", published.content_address);
                println!(
                    "  transaction: {} (block {})",
                    published.tx_hash, published.block
                );
                Ok(ExitCode::SUCCESS)
            }
            Err(err) => {
                eprintln!(
                    "Failed to mirror {}{} ({} step): {err:#}",
                    self.domain,
                    self.path,
                    err.step()
                );
                if let PublishError::NotVerified { domain, .. } = &err {
                    eprintln!(
                        "Add this TXT record to {domain} and try again:\n  {}",
                        dns::expected_record(&publisher.to_checksum())
                    );
                }
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
