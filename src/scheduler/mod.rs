// backuptool/src/scheduler/mod.rs
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::errors::TriggerError;
use crate::orchestrator::Orchestrator;

/// Spawns one interval loop per scheduled target. A tick that finds the
/// target busy is skipped with a warning; the running job already covers it.
pub fn spawn_schedules(orchestrator: Arc<Orchestrator>) {
    let scheduled: Vec<(String, u64)> = orchestrator
        .targets()
        .iter()
        .filter_map(|t| {
            t.schedule
                .as_ref()
                .map(|s| (t.name.clone(), s.interval_minutes))
        })
        .collect();

    for (name, interval_minutes) in scheduled {
        info!(target = %name, interval_minutes, "schedule active");
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_minutes * 60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; consume it so startup
            // does not fire every scheduled target at once.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match orchestrator.trigger(&name) {
                    Ok(job_id) => {
                        info!(target = %name, job = %job_id, "scheduled backup triggered")
                    }
                    Err(TriggerError::TargetBusy { held_by, .. }) => {
                        warn!(target = %name, held_by = %held_by, "scheduled tick skipped, target busy")
                    }
                    Err(err) => warn!(target = %name, %err, "scheduled trigger failed"),
                }
            }
        });
    }
}
