//! The retry supervisor.
//!
//! Wraps a fresh [`MustWorker`] around each attempt and re-runs on
//! retriable failure, bounded by a sliding tick-bucket rate limit. The
//! whole retry state lives in one 64-bit atomic packing `(tick, counter)`;
//! disabling retries installs a dead-tick sentinel and closes a one-shot
//! cancel signal that interrupts any backoff wait in progress.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use gosu_types::{Cause, Report, Status, TaskResult};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::{MustWorker, Worker, WorkerSeed};
use crate::options::Options;
use crate::task::Task;
use crate::whiteboard::Whiteboard;

const TICK_DEAD: u32 = u32::MAX;

fn pack(tick: u32, counter: u32) -> u64 {
    tick as u64 | ((counter as u64) << 32)
}

fn unpack(state: u64) -> (u32, u32) {
    (state as u32, (state >> 32) as u32)
}

/// Backoff before retry number `counter`: a quadratic ramp from 0.5x to
/// 1.5x of the scaled base as the counter approaches the rate limit.
fn backoff_delay(base: Duration, scale: f64, counter: u32, limit: u32) -> Duration {
    let ratio = (counter.saturating_sub(1) as f64 / limit.max(1) as f64).clamp(0.0, 1.0);
    Duration::from_secs_f64(base.as_secs_f64() * (0.5 + ratio * ratio) * scale)
}

pub(crate) struct RetryWorker {
    seed: WorkerSeed,
    scope: crate::scope::Scope,
    must: RwLock<Option<Arc<MustWorker>>>,
    retry_state: AtomicU64,
    retry_cancel: CancellationToken,
    live: AtomicU8,
}

impl RetryWorker {
    pub(crate) fn create(seed: WorkerSeed) -> Arc<RetryWorker> {
        let scope = seed.parent.child();
        Arc::new(RetryWorker {
            seed,
            scope,
            must: RwLock::new(None),
            retry_state: AtomicU64::new(0),
            retry_cancel: CancellationToken::new(),
            live: AtomicU8::new(Status::Idle as u8),
        })
    }

    fn set_live(&self, status: Status) {
        self.live.store(status as u8, Ordering::SeqCst);
    }

    fn live_status(&self) -> Status {
        Status::from_byte(self.live.load(Ordering::SeqCst))
    }

    fn current_must(&self) -> Option<Arc<MustWorker>> {
        self.must.read().unwrap().clone()
    }

    fn disable_retries(&self) {
        loop {
            let state = self.retry_state.load(Ordering::SeqCst);
            let (tick, counter) = unpack(state);
            if tick == TICK_DEAD {
                return;
            }
            if self
                .retry_state
                .compare_exchange(state, pack(TICK_DEAD, counter), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.retry_cancel.cancel();
                return;
            }
        }
    }

    fn retriable(&self, result: &TaskResult) -> bool {
        match result {
            Err(cause) if cause.is_non_retriable() => return false,
            Err(_) => {}
            Ok(()) => {
                if !self.seed.options.retry_success {
                    return false;
                }
            }
        }
        let (tick, _) = unpack(self.retry_state.load(Ordering::SeqCst));
        tick != TICK_DEAD
    }

    /// Decide whether to re-run after `result`, and if so wait out the
    /// backoff. Returns false when the worker should go terminal.
    async fn try_retry(&self, result: &TaskResult) -> bool {
        if self.scope.is_cancelled() {
            return false;
        }
        if !self.retriable(result) {
            return false;
        }

        let rate = self.seed.options.retry_limit;
        let counter;
        loop {
            let state = self.retry_state.load(Ordering::SeqCst);
            let (mut tick, mut count) = unpack(state);
            if tick == TICK_DEAD {
                return false;
            }
            let current = rate.ticks();
            if tick != current {
                tick = current;
                count = 0;
            }
            count += 1;
            if self
                .retry_state
                .compare_exchange(state, pack(tick, count), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if count > rate.count {
                    return false;
                }
                counter = count;
                break;
            }
        }

        let wait = backoff_delay(
            self.seed.options.retry_backoff,
            self.seed.options.retry_backoff_scale,
            counter,
            rate.count,
        );
        self.seed.logger.line(format!(
            "Retrying in {} ({}/{}), error: {}",
            gosu_types::timespan::format(wait),
            counter,
            rate.count,
            match result {
                Ok(()) => "none".to_string(),
                Err(cause) => cause.to_string(),
            }
        ));

        self.set_live(Status::Retrying);
        tokio::select! {
            _ = self.scope.done() => { self.set_live(Status::Idle); false }
            _ = self.retry_cancel.cancelled() => { self.set_live(Status::Idle); false }
            _ = sleep(wait) => true,
        }
    }
}

#[async_trait]
impl Worker for RetryWorker {
    fn task(&self) -> &Task {
        &self.seed.task
    }

    fn options(&self) -> &Options {
        &self.seed.options
    }

    fn namespace(&self) -> String {
        self.seed.logger.namespace().to_string()
    }

    fn whiteboard(&self) -> Whiteboard {
        self.seed.whiteboard.clone()
    }

    fn status(&self) -> Cause {
        if self.scope.is_cancelled() {
            return self.scope.cause();
        }
        if let Some(must) = self.current_must() {
            if self.live_status().is_alive() {
                return must.status();
            }
        }
        Cause::of(self.live_status())
    }

    fn inspect(&self) -> Report {
        self.current_must()
            .map(|m| m.inspect())
            .unwrap_or_default()
    }

    async fn run(self: Arc<Self>) -> TaskResult {
        let result = loop {
            self.set_live(Status::Starting);
            let must = MustWorker::create(self.seed.clone());
            *self.must.write().unwrap() = Some(must.clone());

            self.set_live(Status::Running);
            let result = tokio::select! {
                _ = self.scope.done() => break self.scope.result(),
                result = must.clone().run() => result,
            };
            self.set_live(must.live_status());

            if !self.try_retry(&result).await {
                break result;
            }
        };

        self.scope.cancel(match &result {
            Ok(()) => Cause::complete(),
            Err(cause) => cause.clone(),
        });
        self.set_live(Status::Idle);
        result
    }

    async fn stop(&self) {
        self.disable_retries();
        if let Some(must) = self.current_must() {
            must.stop().await;
        } else {
            self.scope.cancel(Cause::of(Status::Cancelled));
        }
    }

    fn kill(&self) {
        self.disable_retries();
        if let Some(must) = self.current_must() {
            must.kill();
        } else {
            self.scope.cancel(Cause::of(Status::Cancelled));
        }
    }

    async fn done(&self) {
        self.scope.done().await;
    }

    fn traverse(&self, f: &mut dyn FnMut(&Arc<dyn Worker>) -> bool) {
        if let Some(must) = self.current_must() {
            must.traverse(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_state_packing() {
        let state = pack(0x1234_5678, 42);
        assert_eq!(unpack(state), (0x1234_5678, 42));
        let (tick, _) = unpack(pack(TICK_DEAD, 7));
        assert_eq!(tick, TICK_DEAD);
    }

    #[test]
    fn backoff_curve_endpoints() {
        let base = Duration::from_millis(500);
        // counter=1 sits at 0.5x of the scaled base.
        assert_eq!(
            backoff_delay(base, 2.0, 1, 10),
            Duration::from_secs_f64(0.5 * 2.0 * 0.5)
        );
        // counter=limit sits just under 1.5x; past the limit it saturates.
        let near = backoff_delay(base, 2.0, 10, 10);
        let capped = backoff_delay(base, 2.0, 25, 10);
        assert!(near < Duration::from_secs_f64(0.5 * 2.0 * 1.5));
        assert_eq!(capped, Duration::from_secs_f64(0.5 * 2.0 * 1.5));
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let base = Duration::from_millis(500);
        let mut last = Duration::ZERO;
        for counter in 1..=12 {
            let wait = backoff_delay(base, 1.0, counter, 10);
            assert!(wait >= last, "backoff shrank at counter {counter}");
            last = wait;
        }
    }
}
