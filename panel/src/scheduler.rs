//! Auto-reset scheduler: a single background task that polls every 60 s
//! and re-dispatches the active tunnels of any core whose reset timer is
//! due. The timestamps are committed before the reset runs so a crash
//! mid-cycle cannot cause a tight reset loop.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{error, info};

use crate::orchestrator;
use crate::state::AppState;

pub const RESET_CORES: [&str; 5] = ["rathole", "backhaul", "chisel", "frp", "gost"];

pub async fn run(state: AppState) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        tick(&state).await;
    }
}

async fn tick(state: &AppState) {
    let due_cores: Vec<String> = {
        let mut store = state.store.lock().unwrap();
        let now = Utc::now();
        let mut due = Vec::new();

        for core in RESET_CORES {
            let config = store.reset_config(core);
            if !config.enabled {
                continue;
            }

            let interval_minutes = config.interval_minutes.max(1) as i64;
            match config.next_reset {
                None => {
                    // Enabled but never scheduled; start the clock.
                    store.update_reset_config(core, |c| {
                        c.next_reset = Some(now + ChronoDuration::minutes(interval_minutes));
                    });
                }
                Some(next_reset) if next_reset <= now => {
                    store.update_reset_config(core, |c| {
                        c.last_reset = Some(now);
                        c.next_reset = Some(now + ChronoDuration::minutes(interval_minutes));
                    });
                    due.push(core.to_string());
                }
                Some(_) => {}
            }
        }
        due
    };

    for core in due_cores {
        info!(core = %core, "auto-reset due, restarting core tunnels");
        orchestrator::reset_core(state, &core).await;
        let config = state.store.lock().unwrap().reset_config(&core);
        match config.next_reset {
            Some(next_reset) => info!(core = %core, %next_reset, "auto-reset completed"),
            None => error!(core = %core, "auto-reset completed but next_reset is unset"),
        }
    }
}
