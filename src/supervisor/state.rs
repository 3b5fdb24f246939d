//! Supervisor state
//!
//! Flags read on the request path (`running`, `ready`) are atomics. The rest
//! lives behind a lock that also serializes generation checks, so a write
//! tagged with an old generation can never land after a newer `start()` or
//! `stop()` has begun.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// Supervisor lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Idle,
    Starting,
    ConfiguringCandidate,
    LaunchingProcess,
    AwaitingPortReady,
    TestingConnectivity,
    Ready,
    Failed,
    Destroyed,
}

impl Phase {
    /// No run is making progress in this phase
    pub fn is_settled(self) -> bool {
        matches!(self, Phase::Idle | Phase::Ready | Phase::Failed | Phase::Destroyed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Starting => "starting",
            Phase::ConfiguringCandidate => "configuring-candidate",
            Phase::LaunchingProcess => "launching-process",
            Phase::AwaitingPortReady => "awaiting-port-ready",
            Phase::TestingConnectivity => "testing-connectivity",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
            Phase::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct Detail {
    active_server_host: Option<String>,
    last_error: Option<String>,
    exit_ip: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of the supervisor state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorSnapshot {
    pub running: bool,
    pub ready: bool,
    pub active_server_host: Option<String>,
    pub last_error: Option<String>,
    pub exit_ip: Option<String>,
    pub generation: u64,
    pub phase: Phase,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Shared supervisor state, written only by the supervisor
pub struct SupervisorState {
    generation: AtomicU64,
    running: AtomicBool,
    ready: AtomicBool,
    detail: RwLock<Detail>,
    phase_tx: watch::Sender<Phase>,
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

impl SupervisorState {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        SupervisorState {
            generation: AtomicU64::new(0),
            running: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            detail: RwLock::new(Detail::default()),
            phase_tx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    /// Subscribe to phase changes
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        let detail = self.detail.read();
        SupervisorSnapshot {
            running: self.is_running(),
            ready: self.is_ready(),
            active_server_host: detail.active_server_host.clone(),
            last_error: detail.last_error.clone(),
            exit_ip: detail.exit_ip.clone(),
            generation: self.generation(),
            phase: self.phase(),
            updated_at: detail.updated_at,
        }
    }

    /// Open a new generation: clear everything and mark running
    pub(crate) fn begin(&self) -> u64 {
        let mut detail = self.detail.write();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *detail = Detail {
            updated_at: Some(Utc::now()),
            ..Detail::default()
        };
        self.ready.store(false, Ordering::Release);
        self.running.store(true, Ordering::Release);
        self.publish(Phase::Starting);
        debug!("Supervisor generation {} started", generation);
        generation
    }

    /// Retire the current generation and clear all fields
    pub(crate) fn reset(&self, phase: Phase) -> u64 {
        let mut detail = self.detail.write();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *detail = Detail {
            updated_at: Some(Utc::now()),
            ..Detail::default()
        };
        self.ready.store(false, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.publish(phase);
        generation
    }

    /// Move to `phase` if `generation` is still current
    pub(crate) fn set_phase(&self, generation: u64, phase: Phase) -> bool {
        self.commit(generation, |state, _| state.publish(phase))
    }

    pub(crate) fn mark_ready(&self, generation: u64, host: &str, exit_ip: Option<String>) -> bool {
        self.commit(generation, |state, detail| {
            detail.active_server_host = Some(host.to_string());
            detail.last_error = None;
            detail.exit_ip = exit_ip;
            state.ready.store(true, Ordering::Release);
            state.publish(Phase::Ready);
        })
    }

    /// Terminal failure of a generation: not ready, not running
    pub(crate) fn mark_failed(&self, generation: u64, error: &str) -> bool {
        self.commit(generation, |state, detail| {
            detail.active_server_host = None;
            detail.exit_ip = None;
            detail.last_error = Some(error.to_string());
            state.ready.store(false, Ordering::Release);
            state.running.store(false, Ordering::Release);
            state.publish(Phase::Failed);
        })
    }

    fn commit<F>(&self, generation: u64, apply: F) -> bool
    where
        F: FnOnce(&Self, &mut Detail),
    {
        let mut detail = self.detail.write();
        if !self.is_current(generation) {
            debug!(
                "Discarding stale write from generation {} (current {})",
                generation,
                self.generation()
            );
            return false;
        }
        apply(self, &mut *detail);
        detail.updated_at = Some(Utc::now());
        true
    }

    fn publish(&self, phase: Phase) {
        self.phase_tx.send_replace(phase);
    }
}
