//! # Heartbeat Monitor
//!
//! Purpose: Probe every pooled connection on a fixed interval and take
//! unhealthy ones out of selection before callers hit them.
//!
//! ## Design Principles
//! 1. **Windowed Smoothing**: Outcomes are counted in fixed-size windows;
//!    a single failed probe never changes state.
//! 2. **Two Stages**: Enough invalid probes in a window degrade the
//!    connection; `death_threshold` bad windows in a row evict it.
//! 3. **Pure State Machine**: `HeartbeatWindow` holds no I/O and returns a
//!    verdict per probe; the monitor task applies verdicts to the pool.
//!
//! ## Slot Lifecycle
//!
//! ```text
//! healthy ─(invalid >= threshold)─► Invalidated ─(good window)─► Recovered
//!    │                                   │
//!    └──────(death_threshold bad windows)┴─► Dead ─(valid probe)─► Reinstated
//! ```

use std::time::Duration;

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::config::{HealthCheckMode, HeartbeatConfig};
use crate::connection::Connection;
use crate::pool::ConnectionPool;
use crate::waiter::RequestOptions;

/// State change produced by one probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unchanged,
    /// Invalid probes in the current window reached the threshold.
    Invalidated,
    /// A window closed good after the slot had been invalidated.
    Recovered,
    /// `death_threshold` consecutive bad windows.
    Dead,
    /// First valid probe after death.
    Reinstated,
}

/// Per-slot probe history.
#[derive(Debug, Clone)]
pub struct HeartbeatWindow {
    window_size: usize,
    invalidation_threshold: usize,
    death_threshold: usize,
    probes: usize,
    invalid: usize,
    bad_windows: usize,
    invalidated: bool,
    dead: bool,
}

impl HeartbeatWindow {
    pub fn new(config: &HeartbeatConfig) -> Self {
        HeartbeatWindow {
            window_size: config.window_size,
            invalidation_threshold: config.invalidation_threshold,
            death_threshold: config.death_threshold,
            probes: 0,
            invalid: 0,
            bad_windows: 0,
            invalidated: false,
            dead: false,
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Consecutive bad windows so far.
    pub fn bad_windows(&self) -> usize {
        self.bad_windows
    }

    /// Records one probe outcome.
    ///
    /// **Logic**:
    /// 1. A dead slot ignores invalid probes and is reinstated by a valid one.
    /// 2. Reaching the invalidation threshold mid-window invalidates at once.
    /// 3. On a full window, a bad one counts toward death and a good one
    ///    resets the counter and recovers an invalidated slot.
    pub fn record(&mut self, valid: bool) -> Verdict {
        if self.dead {
            if !valid {
                return Verdict::Unchanged;
            }
            self.reset();
            return Verdict::Reinstated;
        }

        self.probes += 1;
        if !valid {
            self.invalid += 1;
        }

        let mut verdict = Verdict::Unchanged;
        if !self.invalidated && self.invalid >= self.invalidation_threshold {
            self.invalidated = true;
            verdict = Verdict::Invalidated;
        }

        if self.probes == self.window_size {
            let bad = self.invalid >= self.invalidation_threshold;
            self.probes = 0;
            self.invalid = 0;
            if bad {
                self.bad_windows += 1;
                if self.bad_windows >= self.death_threshold {
                    self.bad_windows = 0;
                    self.dead = true;
                    return Verdict::Dead;
                }
            } else {
                self.bad_windows = 0;
                if self.invalidated {
                    self.invalidated = false;
                    verdict = Verdict::Recovered;
                }
            }
        }
        verdict
    }

    fn reset(&mut self) {
        self.probes = 0;
        self.invalid = 0;
        self.bad_windows = 0;
        self.invalidated = false;
        self.dead = false;
    }
}

/// Background task probing the pool.
pub struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn start(pool: ConnectionPool, config: HeartbeatConfig, handle: &Handle) -> Self {
        debug!(
            interval = ?config.ping_interval(),
            window = config.window_size,
            detection = ?config.detection_time(),
            "heartbeat started"
        );
        HeartbeatMonitor {
            task: handle.spawn(run(pool, config)),
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(pool: ConnectionPool, config: HeartbeatConfig) {
    let mut windows: Vec<HeartbeatWindow> = (0..pool.size()).map(|_| HeartbeatWindow::new(&config)).collect();
    let timeout = config.probe_timeout();
    let mut ticker = tokio::time::interval(config.ping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if pool.is_closed() {
            return;
        }

        let targets = pool.probe_targets();
        let outcomes = join_all(targets.iter().map(|(pos, conn)| {
            let mode = &config.mode;
            async move { (*pos, probe(conn, mode, timeout).await) }
        }))
        .await;

        for (pos, valid) in outcomes {
            let Some(window) = windows.get_mut(pos) else { continue };
            let verdict = window.record(valid);
            trace!(slot = pos, valid, ?verdict, "heartbeat probe");
            match verdict {
                Verdict::Unchanged => {}
                Verdict::Invalidated => pool.invalidate(pos),
                Verdict::Recovered => pool.recover(pos),
                Verdict::Dead => pool.evict(pos),
                Verdict::Reinstated => pool.reinstate(pos),
            }
        }
    }
}

/// One probe; any error or timeout is an invalid outcome.
async fn probe(conn: &Connection, mode: &HealthCheckMode, timeout: Duration) -> bool {
    let opts = RequestOptions::new().with_timeout(timeout);
    let sent = match mode {
        HealthCheckMode::Ping => conn.ping(opts),
        HealthCheckMode::Call { function } => conn.call(function, Vec::new(), opts),
        HealthCheckMode::Eval { expr } => conn.eval(expr, Vec::new(), opts),
    };
    match sent {
        Ok(response) => response.await.is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> HeartbeatWindow {
        HeartbeatWindow::new(&HeartbeatConfig {
            window_size: 4,
            invalidation_threshold: 2,
            death_threshold: 4,
            ..HeartbeatConfig::default()
        })
    }

    #[test]
    fn sixteen_invalid_probes_evict_once() {
        let mut window = window();
        let verdicts: Vec<Verdict> = (0..20).map(|_| window.record(false)).collect();

        assert_eq!(verdicts[1], Verdict::Invalidated);
        let dead: Vec<usize> = verdicts
            .iter()
            .enumerate()
            .filter(|(_, v)| **v == Verdict::Dead)
            .map(|(i, _)| i + 1)
            .collect();
        assert_eq!(dead, vec![16]);
        assert_eq!(verdicts.iter().filter(|v| **v == Verdict::Invalidated).count(), 1);
    }

    #[test]
    fn single_blip_changes_nothing() {
        let mut window = window();
        let verdicts: Vec<Verdict> = [true, false, true, true, true, true, true, true]
            .into_iter()
            .map(|valid| window.record(valid))
            .collect();
        assert!(verdicts.iter().all(|v| *v == Verdict::Unchanged));
    }

    #[test]
    fn good_window_recovers() {
        let mut window = window();
        assert_eq!(window.record(false), Verdict::Unchanged);
        assert_eq!(window.record(false), Verdict::Invalidated);
        window.record(true);
        window.record(true);
        assert_eq!(window.bad_windows(), 1);

        let verdicts: Vec<Verdict> = (0..4).map(|_| window.record(true)).collect();
        assert_eq!(verdicts[3], Verdict::Recovered);
        assert_eq!(window.bad_windows(), 0);
        assert!(!window.is_invalidated());
    }

    #[test]
    fn dead_slot_reinstated_by_valid_probe() {
        let mut window = window();
        for _ in 0..16 {
            window.record(false);
        }
        assert!(window.is_dead());
        assert_eq!(window.record(false), Verdict::Unchanged);
        assert_eq!(window.record(true), Verdict::Reinstated);
        assert!(!window.is_dead());
        assert!(!window.is_invalidated());
    }
}
