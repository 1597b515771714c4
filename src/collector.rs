//! The background collector: decouples application-visible close from
//!  resource teardown. Runs on its own task, sweeping broken records into the
//!  closed table and reclaiming closed records after a quiescence delay.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::registry::Registry;

/// Wakes the collector (and anything polling alongside it, like a synchronous
///  close draining its send buffer) ahead of its regular interval.
pub(crate) struct Trigger {
    notify: Notify,
}

impl Trigger {
    pub fn new() -> Arc<Trigger> {
        Arc::new(Trigger {
            notify: Notify::new(),
        })
    }

    pub fn fire(&self) {
        self.notify.notify_waiters();
    }

    /// Wait for a trigger or until `timeout` elapsed, whichever comes first.
    pub async fn wait_timeout(&self, timeout: Duration) {
        select! {
            _ = self.notify.notified() => {}
            _ = sleep(timeout) => {}
        }
    }
}

/// Run the collector until global close, then drain every remaining record.
pub(crate) fn spawn(registry: Arc<Registry>, trigger: Arc<Trigger>) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("collector started");

        while !registry.is_closing() {
            registry.check_broken_sockets(false);
            trigger
                .wait_timeout(registry.config().collector_interval)
                .await;
        }

        // global close: everything still live is force-closed, then the closed
        //  table is swept until no record is left
        info!("collector: global close - draining all sockets");
        registry.close_all_live();

        loop {
            registry.check_broken_sockets(true);
            if registry.closed_table_empty() {
                break;
            }
            sleep(registry.config().poll_granularity).await;
        }
        debug!("collector exiting");
    })
}
