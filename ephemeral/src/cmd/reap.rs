use std::collections::HashSet;
use std::process::ExitCode;

use clap::Args;
use sandbox_engine::{StorageAllocator, StorageCaps, StorageRoots};
use tracing::info;

use crate::config::ConfigArgs;
use crate::error::CliResult;

#[derive(Args)]
pub struct ReapArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

/// Remove every sandbox storage area under the configured roots.
///
/// Only safe while no engine is using those roots.
pub async fn run_reap(args: ReapArgs) -> CliResult<ExitCode> {
    let config = args.config.load().await?.engine;
    let allocator = StorageAllocator::new(
        StorageRoots {
            storage_root: config.storage_root.clone(),
            shm_root: config.shm_root.clone(),
        },
        StorageCaps::default(),
    );

    let reclaimed = allocator.reclaim_orphans(&HashSet::new()).await;
    info!(
        reclaimed,
        storage_root = %config.storage_root.display(),
        shm_root = %config.shm_root.display(),
        "reap complete"
    );
    println!("reclaimed {reclaimed} storage area(s)");
    Ok(ExitCode::SUCCESS)
}
