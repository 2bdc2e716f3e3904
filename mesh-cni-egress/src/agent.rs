use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{EgressArgs, ManagerConfig};
use crate::manager::{Dataplane, EgressIpManager};
use crate::node::NodeState;
use crate::readiness::Readiness;
use crate::tracker::EgwHealthReport;
use crate::update::EgressUpdate;
use crate::{Error, Result, http};

const RESYNC_INTERVAL: Duration = Duration::from_secs(10);
const REPORT_CHANNEL_SIZE: usize = 100;

/// Runs the egress manager and its readiness endpoint until `cancel` fires
/// or either of them stops.
///
/// `readiness` is served on `/readyz` and should be the aggregator
/// `dataplane.health` reports to.
pub async fn start(
    args: EgressArgs,
    dataplane: Dataplane,
    readiness: Arc<Readiness>,
    node: Arc<NodeState>,
    updates: mpsc::Receiver<EgressUpdate>,
    cancel: CancellationToken,
) -> Result<()> {
    let (report_tx, report_rx) = mpsc::channel(REPORT_CHANNEL_SIZE);
    let manager = EgressIpManager::new(
        ManagerConfig::from(&args),
        dataplane,
        node,
        report_tx,
        cancel.child_token(),
    )?;
    info!(node = %args.node_name, "starting egress gateway manager");

    let server = http::serve(
        args.egress_readiness_address,
        readiness,
        cancel.child_token(),
    );
    let driver = run(
        manager,
        updates,
        report_rx,
        RESYNC_INTERVAL,
        cancel.child_token(),
    );

    tokio::select! {
        _ = cancel.cancelled() => {},
        h = server => exit("egress http", h),
        h = driver => exit("egress manager", h),
    }
    Ok(())
}

fn exit(task: &str, out: Result<()>) {
    match out {
        Ok(_) => {
            info!("{task} exited")
        }
        Err(e) => {
            error!("{task} failed with error: {e}")
        }
    }
}

/// Feeds updates and health reports into `manager` and completes a pass
/// after every batch and on every tick of `resync_interval`.
pub async fn run(
    mut manager: EgressIpManager,
    mut updates: mpsc::Receiver<EgressUpdate>,
    mut reports: mpsc::Receiver<EgwHealthReport>,
    resync_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut resync = tokio::time::interval(resync_interval);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            update = updates.recv() => {
                let Some(update) = update else {
                    break Err(Error::ChannelError);
                };
                manager.on_update(update);
                while let Ok(update) = updates.try_recv() {
                    manager.on_update(update);
                }
            }
            Some(report) = reports.recv() => {
                manager.on_health_report(report);
                while let Ok(report) = reports.try_recv() {
                    manager.on_health_report(report);
                }
            }
            _ = resync.tick() => {}
        }

        if let Err(e) = manager.complete_deferred_work() {
            if e.is_not_ready() {
                debug!("egress dataplane not ready: {e}");
            } else {
                error!("egress dataplane pass failed: {e}");
            }
        }
    };
    manager.stop();
    result
}
