//! Fixed-rate poll scheduler.
//!
//! One named thread waits out the initial delay, then calls
//! [`StreamRegistry::tick`] every poll interval. Ticks that fall due while a
//! previous tick is still running are coalesced, never queued.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, after, bounded, select, tick};

use crate::core::config::StreamConfig;
use crate::core::errors::{BlsError, Result};
use crate::stream::registry::StreamRegistry;

/// Owner handle for the poller thread. Dropping it stops the thread.
pub struct PollScheduler {
    stop_tx: Option<Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

impl PollScheduler {
    pub fn spawn(registry: Arc<StreamRegistry>, config: &StreamConfig) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let initial_delay = config.initial_delay();
        let interval = config.poll_interval();

        let join = thread::Builder::new()
            .name("bls-poller".to_string())
            .spawn(move || scheduler_thread_main(&registry, &stop_rx, initial_delay, interval))
            .map_err(|e| BlsError::Runtime {
                details: format!("failed to spawn poll scheduler thread: {e}"),
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }

    /// Stop ticking and wait for an in-flight tick to finish.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        // Dropping the sender disconnects the stop channel, which wakes the thread.
        drop(self.stop_tx.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.halt();
    }
}

fn scheduler_thread_main(
    registry: &StreamRegistry,
    stop_rx: &Receiver<()>,
    initial_delay: Duration,
    interval: Duration,
) {
    let delay = after(initial_delay);
    select! {
        recv(stop_rx) -> _ => return,
        recv(delay) -> _ => {}
    }

    let ticker = tick(interval);
    loop {
        registry.tick();
        select! {
            recv(stop_rx) -> _ => return,
            recv(ticker) -> _ => {}
        }
    }
}
