//! Scheduler observability counters.
//! Cheap atomic counters so operators (and tests) can see that subsystems keep
//! running and how often faults were contained.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static TICKS_RUN: AtomicU64 = AtomicU64::new(0);
static SUBSYSTEM_FAULTS: AtomicU64 = AtomicU64::new(0);
static TRADES_COMMITTED: AtomicU64 = AtomicU64::new(0);
static TRADES_ABORTED: AtomicU64 = AtomicU64::new(0);
static BOOTH_SALES: AtomicU64 = AtomicU64::new(0);

static SUBSYSTEM_RUNS: OnceLock<Mutex<HashMap<&'static str, u64>>> = OnceLock::new();

fn subsystem_lock() -> &'static Mutex<HashMap<&'static str, u64>> {
    SUBSYSTEM_RUNS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn inc_ticks_run() {
    TICKS_RUN.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_subsystem_fault() {
    SUBSYSTEM_FAULTS.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_trade_committed() {
    TRADES_COMMITTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_trade_aborted() {
    TRADES_ABORTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_booth_sale() {
    BOOTH_SALES.fetch_add(1, Ordering::Relaxed);
}

/// Record one completed run of a named scheduler subsystem.
pub fn record_subsystem_run(name: &'static str) {
    let mut guard = subsystem_lock().lock().expect("subsystem counter mutex poisoned");
    *guard.entry(name).or_insert(0) += 1;
}

pub fn subsystem_runs_snapshot() -> HashMap<&'static str, u64> {
    subsystem_lock()
        .lock()
        .expect("subsystem counter mutex poisoned")
        .clone()
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub ticks_run: u64,
    pub subsystem_faults: u64,
    pub trades_committed: u64,
    pub trades_aborted: u64,
    pub booth_sales: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        ticks_run: TICKS_RUN.load(Ordering::Relaxed),
        subsystem_faults: SUBSYSTEM_FAULTS.load(Ordering::Relaxed),
        trades_committed: TRADES_COMMITTED.load(Ordering::Relaxed),
        trades_aborted: TRADES_ABORTED.load(Ordering::Relaxed),
        booth_sales: BOOTH_SALES.load(Ordering::Relaxed),
    }
}
