use std::{sync::Arc, time::Duration};

use log::trace;
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use super::Tsm;

/// Drains `tsm`'s timers every `resolution` from a tokio task.
///
/// Abort the returned handle to stop the driver.
pub fn spawn_timer_driver(tsm: Arc<Tsm>, resolution: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(resolution);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let fired = tsm.process_timers();
            if fired > 0 {
                trace!("Timer driver fired {} TSM timers", fired);
            }
        }
    })
}
