//! Global atomic counters for orchestrator observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when the CLI exits).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    advances: AtomicU64,
    commits: AtomicU64,
    gate_failures: AtomicU64,
    handoff_rejections: AtomicU64,
    agent_failures: AtomicU64,
    subscriber_faults: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            advances: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            gate_failures: AtomicU64::new(0),
            handoff_rejections: AtomicU64::new(0),
            agent_failures: AtomicU64::new(0),
            subscriber_faults: AtomicU64::new(0),
        }
    }

    pub fn inc_advances(&self) {
        self.advances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_commits(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gate_failures(&self) {
        self.gate_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_handoff_rejections(&self) {
        self.handoff_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_agent_failures(&self) {
        self.agent_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A bus subscriber returned an error or panicked.
    pub fn inc_subscriber_faults(&self) {
        self.subscriber_faults.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "subscriber_faults", "counter incremented");
    }

    pub fn advances(&self) -> u64 {
        self.advances.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn gate_failures(&self) -> u64 {
        self.gate_failures.load(Ordering::Relaxed)
    }

    pub fn handoff_rejections(&self) -> u64 {
        self.handoff_rejections.load(Ordering::Relaxed)
    }

    pub fn agent_failures(&self) -> u64 {
        self.agent_failures.load(Ordering::Relaxed)
    }

    pub fn subscriber_faults(&self) -> u64 {
        self.subscriber_faults.load(Ordering::Relaxed)
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            advances = self.advances(),
            commits = self.commits(),
            gate_failures = self.gate_failures(),
            handoff_rejections = self.handoff_rejections(),
            agent_failures = self.agent_failures(),
            subscriber_faults = self.subscriber_faults(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        assert_eq!(m.commits(), 0);
        m.inc_commits();
        m.inc_commits();
        m.inc_gate_failures();
        assert_eq!(m.commits(), 2);
        assert_eq!(m.gate_failures(), 1);
        assert_eq!(m.subscriber_faults(), 0);
    }
}
