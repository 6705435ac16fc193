//! blocksync - incremental IP blocklist sync for Linux firewalls

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::FmtSubscriber;

use blocksync::cli::{Cli, Commands};
use blocksync::commands::fetch::FetchOptions;
use blocksync::context::Verbosity;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Verbosity(cli.verbose).log_level(cli.quiet))
        .with_target(false)
        .with_thread_ids(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Fetch {
            host,
            token,
            all,
            ignorecert,
            timeout,
        } => {
            blocksync::commands::fetch::run(FetchOptions {
                config: cli.config,
                config_dir: cli.config_dir,
                lock_dir: cli.lock_dir,
                host,
                token,
                all,
                ignore_cert: ignorecert,
                timeout,
                verbosity: cli.verbose,
            })
            .await
        }
        Commands::Backup { set, rules } => {
            blocksync::commands::backup::run(&cli.config, &cli.config_dir, set, rules).await
        }
        Commands::Version => {
            println!("blocksync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
