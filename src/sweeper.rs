use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::dispatcher::SharedDb;

const SWEEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs once during graceful shutdown, after the server has stopped accepting
/// requests: any task still `running` lost its worker (a crashed worker never
/// reports `executed`), so it is marked `abandoned`. If the sweep cannot
/// finish within the timeout the process still exits and the remaining
/// `running` rows stay inconsistent until the next restart sweeps them.
pub async fn run_sweeper(db: SharedDb) {
    info!("sweeper: marking running tasks as abandoned");
    let sweep = async {
        let guard = db.lock().await;
        guard.set_abandoned()
    };
    match tokio::time::timeout(SWEEP_TIMEOUT, sweep).await {
        Ok(Ok(count)) => info!("sweeper: transitioned {} tasks to abandoned", count),
        Ok(Err(e)) => error!("sweeper: failed to mark abandoned tasks: {}", e),
        Err(_) => warn!(
            "sweeper: timed out after {:?}; running tasks were left unmarked",
            SWEEP_TIMEOUT
        ),
    }
}
