use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::db::Database;
use crate::settings::SettingKey;

pub type SharedDb = Arc<Mutex<Database>>;

type JobFuture = Pin<Box<dyn Future<Output = Result<(), rusqlite::Error>> + Send>>;

/// A maintenance job triggered by a non-null setting value. The busy flag
/// keeps a slow run from piling up behind the next tick; the job simply gets
/// skipped until the previous invocation finishes.
pub struct MaintenanceJob {
    key: SettingKey,
    name: &'static str,
    run: fn(SharedDb, i64) -> JobFuture,
    busy: Arc<AtomicBool>,
}

/// Settings-to-job table, built once at startup. Wiring a new maintenance job
/// is a registration here, not a new branch in the poll loop.
pub fn registry() -> Vec<MaintenanceJob> {
    vec![MaintenanceJob {
        key: SettingKey::DeleteOldTtlMinutes,
        name: "delete-old",
        run: |db, ttl| Box::pin(delete_old_tasks(db, ttl)),
        busy: Arc::new(AtomicBool::new(false)),
    }]
}

/// Retention janitor: drops records queued longer ago than the TTL. Only ever
/// invoked with a validated setting value; a non-positive TTL retains
/// everything.
async fn delete_old_tasks(db: SharedDb, ttl_minutes: i64) -> Result<(), rusqlite::Error> {
    if ttl_minutes <= 0 {
        return Ok(());
    }
    let deleted = db.lock().await.delete_old(ttl_minutes)?;
    if deleted > 0 {
        info!("janitor: deleted {} tasks older than {} minutes", deleted, ttl_minutes);
    }
    Ok(())
}

/// Clears the busy flag when the job task finishes, whether it returned or
/// panicked.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Spawns the job with the setting value as payload, unless its previous
/// invocation is still in flight; returns `None` on a skip. The flag flips
/// before the spawn, so two ticks racing the same job cannot both start it.
fn dispatch(job: &MaintenanceJob, db: SharedDb, value: i64) -> Option<tokio::task::JoinHandle<()>> {
    if job.busy.swap(true, Ordering::SeqCst) {
        info!("dispatcher: {} still running, skipping this tick", job.name);
        return None;
    }

    let guard = BusyGuard(job.busy.clone());
    let name = job.name;
    let fut = (job.run)(db, value);
    Some(tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = fut.await {
            error!("dispatcher: job {} failed: {}", name, e);
        }
    }))
}

/// Polls the settings store once per minute and dispatches every registered
/// job whose setting carries a value. A failing job is logged and retried
/// naturally on the next tick; it never takes the loop down with it.
pub async fn run_dispatcher(db: SharedDb) {
    info!("dispatcher: starting settings poll loop");
    let jobs = registry();
    let mut tick = interval(Duration::from_secs(60));

    loop {
        tick.tick().await;

        let settings = match db.lock().await.get_settings() {
            Ok(s) => s,
            Err(e) => {
                error!("dispatcher: failed to read settings: {}", e);
                continue;
            }
        };

        for job in &jobs {
            let Some(value) = settings.get(job.key) else {
                continue;
            };
            dispatch(job, db.clone(), value);
        }
    }
}
