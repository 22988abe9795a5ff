//! Periodic key maintenance: expiration sweep and master-key rotation.
//!
//! Both routines are plain methods so they can be driven directly, or by
//! `run_pending` against an injected clock, or by the background threads
//! started with `spawn`.

use std::{
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    clock::Clock,
    crypto::keys::{MasterKey, MasterKeyId},
    custodian,
    error::{CustodyError, CustodyResult},
    registry::ClientKeyRegistry,
    store::SharedStore,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Data keys older than this are swept.
    pub key_ttl: Duration,
    pub sweep_interval: Duration,
    pub rotation_interval: Duration,
    /// How often background threads check their tickers.
    pub poll_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            key_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(3600),
            rotation_interval: Duration::from_secs(24 * 3600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Fires once per interval of clock time.
#[derive(Debug)]
pub struct Ticker {
    interval: u64,
    next_due: u64,
}

impl Ticker {
    pub fn new(interval: Duration, now: u64) -> Self {
        let interval = interval.as_secs().max(1);
        Self {
            interval,
            next_due: now.saturating_add(interval),
        }
    }

    /// True if due at `now`; schedules the next firing from `now`.
    pub fn poll(&mut self, now: u64) -> bool {
        if now < self.next_due {
            return false;
        }
        self.next_due = now.saturating_add(self.interval);
        true
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Aliases deleted from the store.
    pub removed: Vec<String>,
    /// Clients whose binding pointed at a deleted alias.
    pub unbound_clients: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationReport {
    pub previous: MasterKeyId,
    pub current: MasterKeyId,
    pub rewrapped: usize,
}

/// What `run_pending` did this time round.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub sweep: Option<CustodyResult<SweepReport>>,
    pub rotation: Option<CustodyResult<RotationReport>>,
}

pub struct KeyLifecycleScheduler {
    store: Arc<SharedStore>,
    registry: Arc<ClientKeyRegistry>,
    clock: Arc<dyn Clock>,
    config: LifecycleConfig,
    sweep_ticker: Mutex<Ticker>,
    rotation_ticker: Mutex<Ticker>,
}

impl KeyLifecycleScheduler {
    pub fn new(
        store: Arc<SharedStore>,
        registry: Arc<ClientKeyRegistry>,
        clock: Arc<dyn Clock>,
        config: LifecycleConfig,
    ) -> Self {
        let now = clock.now();
        Self {
            store,
            registry,
            clock,
            config,
            sweep_ticker: Mutex::new(Ticker::new(config.sweep_interval, now)),
            rotation_ticker: Mutex::new(Ticker::new(config.rotation_interval, now)),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Delete every data key older than the TTL and drop the registry
    /// bindings that still point at them, before the writer lock is
    /// released. Master and signing keys are never considered.
    pub fn sweep_expired(&self) -> CustodyResult<SweepReport> {
        let now = self.clock.now();
        let ttl = self.config.key_ttl.as_secs();
        let (removed, unbound_clients) = self.store.update_then(
            |keystore| {
                let expired: Vec<String> = keystore
                    .data_aliases()
                    .into_iter()
                    .filter(|alias| {
                        keystore
                            .get_entry(alias)
                            .is_some_and(|entry| now.saturating_sub(entry.created_at()) > ttl)
                    })
                    .collect();
                for alias in &expired {
                    keystore.delete_entry(alias);
                }
                Ok(expired)
            },
            |expired| {
                let unbound: Vec<String> = expired
                    .iter()
                    .filter_map(|alias| self.registry.remove_alias(alias))
                    .collect();
                (expired, unbound)
            },
        )?;

        if !removed.is_empty() {
            log::info!(
                "expiration sweep removed {} data keys ({} client bindings)",
                removed.len(),
                unbound_clients.len()
            );
        }
        Ok(SweepReport {
            removed,
            unbound_clients,
        })
    }

    /// Re-wrap every data key under a fresh master key. All or nothing:
    /// on failure the store still holds the previous master key and the
    /// previous wrappings.
    pub fn rotate_master_key(&self) -> CustodyResult<RotationReport> {
        let now = self.clock.now();
        let new_id = MasterKeyId::generate()?;
        let new_key = MasterKey::generate()?;
        let report = self.store.update(|keystore| {
            let previous = custodian::current_master_key(keystore)?.0.clone();
            let rewrapped = custodian::rewrap_all(keystore, new_id.clone(), new_key, now)?;
            Ok(RotationReport {
                previous,
                current: new_id,
                rewrapped,
            })
        })?;
        log::info!(
            "master key rotated {} -> {} ({} data keys re-wrapped)",
            report.previous,
            report.current,
            report.rewrapped
        );
        Ok(report)
    }

    /// Run whichever routine is due by the injected clock.
    pub fn run_pending(&self) -> CycleOutcome {
        let now = self.clock.now();
        let mut outcome = CycleOutcome::default();
        if self.sweep_ticker.lock().poll(now) {
            outcome.sweep = Some(self.sweep_cycle());
        }
        if self.rotation_ticker.lock().poll(now) {
            outcome.rotation = Some(self.rotation_cycle());
        }
        outcome
    }

    fn sweep_cycle(&self) -> CustodyResult<SweepReport> {
        let result = self.sweep_expired();
        if let Err(e) = &result {
            log::error!("expiration sweep failed: {e}");
        }
        result
    }

    fn rotation_cycle(&self) -> CustodyResult<RotationReport> {
        let result = self.rotate_master_key();
        if let Err(e) = &result {
            log::error!("master key rotation failed, previous master key stays active: {e}");
        }
        result
    }

    /// Start one background thread per routine.
    pub fn spawn(self: Arc<Self>) -> CustodyResult<SchedulerHandle> {
        let mut workers = Vec::with_capacity(2);
        let sweeper = Arc::clone(&self);
        workers.push(spawn_worker("key-sweep", self.config.poll_interval, move || {
            if sweeper.sweep_ticker.lock().poll(sweeper.clock.now()) {
                let _ = sweeper.sweep_cycle();
            }
        })?);
        let rotator = Arc::clone(&self);
        workers.push(spawn_worker(
            "key-rotation",
            self.config.poll_interval,
            move || {
                if rotator.rotation_ticker.lock().poll(rotator.clock.now()) {
                    let _ = rotator.rotation_cycle();
                }
            },
        )?);
        log::info!(
            "key lifecycle scheduler started (sweep every {:?}, rotation every {:?})",
            self.config.sweep_interval,
            self.config.rotation_interval
        );
        Ok(SchedulerHandle { workers })
    }
}

struct Worker {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

fn spawn_worker(
    name: &str,
    poll: Duration,
    mut step: impl FnMut() + Send + 'static,
) -> CustodyResult<Worker> {
    let (stop, stopped) = mpsc::channel::<()>();
    let thread = thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            loop {
                match stopped.recv_timeout(poll) {
                    Err(RecvTimeoutError::Timeout) => step(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .map_err(|e| CustodyError::Config(format!("spawn {name} thread: {e}")))?;
    Ok(Worker { stop, thread })
}

/// Stops the background threads when shut down or dropped.
pub struct SchedulerHandle {
    workers: Vec<Worker>,
}

impl SchedulerHandle {
    pub fn shutdown(mut self) {
        self.stop_all();
    }

    fn stop_all(&mut self) {
        for worker in &self.workers {
            let _ = worker.stop.send(());
        }
        for worker in self.workers.drain(..) {
            if worker.thread.join().is_err() {
                log::error!("key lifecycle worker panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_fires_once_per_interval() {
        let mut ticker = Ticker::new(Duration::from_secs(10), 100);
        assert!(!ticker.poll(105));
        assert!(ticker.poll(110));
        assert!(!ticker.poll(115));
        assert!(ticker.poll(125));
    }

    #[test]
    fn ticker_skips_missed_intervals() {
        let mut ticker = Ticker::new(Duration::from_secs(10), 0);
        assert!(ticker.poll(1_000));
        assert!(!ticker.poll(1_005));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let mut ticker = Ticker::new(Duration::ZERO, 0);
        assert!(!ticker.poll(0));
        assert!(ticker.poll(1));
    }
}
