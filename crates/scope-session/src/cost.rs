use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::context::SessionContext;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

struct Accumulator {
    rate_per_minute: f64,
    accrued: f64,
    last_sample: Instant,
    stopped: bool,
}

impl Accumulator {
    /// Adds the cost of the time since the previous sample. No-op once stopped.
    fn sample(&mut self, now: Instant) -> f64 {
        if self.stopped {
            return self.accrued;
        }
        let increment = now.saturating_duration_since(self.last_sample);
        self.accrued += increment.as_secs_f64() / 60.0 * self.rate_per_minute;
        self.last_sample = now;
        self.accrued
    }
}

/// Accrues cost for one lease on the tokio clock.
pub struct CostMeter {
    accumulator: Arc<Mutex<Accumulator>>,
    sampler: Option<JoinHandle<()>>,
    context: SessionContext,
}

impl CostMeter {
    /// Starts sampling every `interval`, counting from `started`.
    pub fn start(
        rate_per_minute: f64,
        interval: Duration,
        started: Instant,
        context: SessionContext,
    ) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_SAMPLE_INTERVAL
        } else {
            interval
        };
        let accumulator = Arc::new(Mutex::new(Accumulator {
            // NaN and negative rates accrue nothing.
            rate_per_minute: rate_per_minute.max(0.0),
            accrued: 0.0,
            last_sample: started,
            stopped: false,
        }));
        context.publish_cost(0.0);

        let sampler = {
            let accumulator = accumulator.clone();
            let context = context.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(started + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    let tick = ticker.tick().await;
                    let amount = {
                        let mut accumulator = accumulator.lock();
                        if accumulator.stopped {
                            break;
                        }
                        accumulator.sample(tick.max(Instant::now()))
                    };
                    debug!(target = "scope.cost", amount, "cost sampled");
                    context.publish_cost(amount);
                }
            })
        };

        Self {
            accumulator,
            sampler: Some(sampler),
            context,
        }
    }

    pub fn current_cost(&self) -> f64 {
        self.accumulator.lock().accrued
    }

    pub fn is_stopped(&self) -> bool {
        self.accumulator.lock().stopped
    }

    /// Takes a final checkpoint and freezes the amount. Repeated calls return
    /// the frozen amount.
    pub fn stop(&mut self) -> f64 {
        let amount = {
            let mut accumulator = self.accumulator.lock();
            let amount = accumulator.sample(Instant::now());
            accumulator.stopped = true;
            amount
        };
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
            self.context.publish_cost(amount);
            info!(target = "scope.cost", amount, "cost meter stopped");
        }
        amount
    }
}

impl Drop for CostMeter {
    fn drop(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }
    }
}
