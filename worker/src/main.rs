use std::{env, io, time::Duration};

use log::{error, info};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use worker::{
    RunConfig, WorkerErr,
    data::ShardCatalog,
    run_rank,
    sync::{LocalGroup, NetGroup},
};

const GROUP_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    if let Some(dir) = env::args().nth(1).filter(|a| a == "inspect").and(env::args().nth(2)) {
        return inspect(&dir);
    }

    let cfg = RunConfig::load().map_err(WorkerErr::from)?;
    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let summary = if cfg.world_size == 1 {
        run_rank(cfg, LocalGroup::single(), cancel).await
    } else {
        let group = NetGroup::connect(cfg.rank, cfg.world_size, &cfg.master_addr, GROUP_TIMEOUT)
            .await
            .map_err(WorkerErr::from)?;
        run_rank(cfg, group, cancel).await
    };

    match summary {
        Ok(summary) => {
            info!(
                step = summary.final_step;
                "finished ({:?}) at {}, recent loss {:?}",
                summary.stop,
                summary.cursor,
                summary.metrics.recent_loss(20)
            );
            Ok(())
        }
        Err(e) => {
            error!("{e}");
            Err(e.into())
        }
    }
}

/// Prints the corpus totals of `dir` and checks every shard.
fn inspect(dir: &str) -> io::Result<()> {
    let catalog = ShardCatalog::open(dir).map_err(WorkerErr::from)?;
    let info = catalog.info().map_err(WorkerErr::from)?;
    println!(
        "{} shard(s), {} row(s), {} byte(s)",
        info.shard_count, info.total_rows, info.total_bytes
    );

    catalog.validate().map_err(WorkerErr::from)?;
    println!("all shards consistent");
    Ok(())
}

/// Turns ctrl-c or SIGTERM into a stop vote at the next step boundary.
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install the SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for ctrl-c: {e}");
                return;
            }
            info!("received ctrl-c, stopping after the current step");
        }
        _ = terminate => info!("received SIGTERM, stopping after the current step"),
    }

    cancel.cancel();
}
