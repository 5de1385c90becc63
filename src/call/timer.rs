//! Cancellable timers of the active session.
//!
//! Each timer runs as a spawned task that invokes its callback once (or once
//! per period). Callbacks only post events back to the agent; the agent
//! still checks the generation, so an abort that loses the race is harmless.

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::trace;

#[derive(Debug, Default)]
pub struct CallTimers {
    ring: Option<JoinHandle<()>>,
    reset: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    grace: HashMap<String, JoinHandle<()>>,
}

fn after<F>(delay: Duration, fire: F) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        sleep(delay).await;
        fire();
    })
}

impl CallTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_ring<F>(&mut self, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel_ring();
        self.ring = Some(after(delay, fire));
    }

    pub fn cancel_ring(&mut self) {
        if let Some(handle) = self.ring.take() {
            trace!("ring timer cancelled");
            handle.abort();
        }
    }

    pub fn ring_armed(&self) -> bool {
        self.ring.is_some()
    }

    pub fn arm_reset<F>(&mut self, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel_reset();
        self.reset = Some(after(delay, fire));
    }

    pub fn cancel_reset(&mut self) {
        if let Some(handle) = self.reset.take() {
            handle.abort();
        }
    }

    /// Starts the duration ticker; the first tick fires one period from now.
    pub fn start_ticker<F>(&mut self, period: Duration, tick: F)
    where
        F: Fn() + Send + 'static,
    {
        self.stop_ticker();
        self.ticker = Some(tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick();
            }
        }));
    }

    pub fn stop_ticker(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }

    pub fn ticking(&self) -> bool {
        self.ticker.is_some()
    }

    /// Arms the disconnect grace timer of `peer_id` unless one is pending.
    pub fn arm_grace<F>(&mut self, peer_id: &str, delay: Duration, fire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.grace.contains_key(peer_id) {
            return false;
        }
        self.grace.insert(peer_id.to_owned(), after(delay, fire));
        true
    }

    pub fn cancel_grace(&mut self, peer_id: &str) {
        if let Some(handle) = self.grace.remove(peer_id) {
            handle.abort();
        }
    }

    /// Cancels every timer owned by the session except the reset timer.
    pub fn cancel_session(&mut self) {
        self.cancel_ring();
        self.stop_ticker();
        for (_, handle) in self.grace.drain() {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        self.cancel_session();
        self.cancel_reset();
    }
}

impl Drop for CallTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
