//! Proxy supervisor
//!
//! Owns the proxy core lifecycle. Each `start()` opens a generation and spawns
//! the single controlling task for it; that task fetches and ranks
//! candidates, then walks them best-first until one passes every readiness
//! stage. After that it stays on as a watchdog until the run is cancelled.

use super::connectivity::{ConnectivityCheck, EchoCheck};
use super::process::{check_executable, resolve_executable, ProxyProcess};
use super::state::{Phase, SupervisorSnapshot, SupervisorState};
use crate::common::net::{port_accepting, wait_for_port};
use crate::config::{sanitize, Config, ServerDescriptor};
use crate::provider::{source_from_config, CandidateSource, ServerPool};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often a ready run checks that the core is still alive
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Connect timeout when checking the SOCKS port is free before a launch
const PORT_CHECK_TIMEOUT: Duration = Duration::from_millis(200);

/// Upper bound on joining the controlling task during `stop()`
const RUN_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Supervisor tunables
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub executable: PathBuf,
    pub config_path: PathBuf,
    pub socks_port: u16,
    pub port_poll_interval: Duration,
    pub port_ready_timeout: Duration,
    pub kill_grace: Duration,
}

impl SupervisorConfig {
    pub fn from_config(config: &Config) -> Self {
        SupervisorConfig {
            executable: config.executable.clone(),
            config_path: config.run_config_path(),
            socks_port: config.socks_port,
            port_poll_interval: config.port_poll_interval(),
            port_ready_timeout: config.port_ready_timeout(),
            kill_grace: config.kill_grace(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct RunHandle {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Everything the controlling task needs, shared with the supervisor
struct Runner {
    config: SupervisorConfig,
    executable: PathBuf,
    source: Arc<dyn CandidateSource>,
    pool: ServerPool,
    check: Arc<dyn ConnectivityCheck>,
    state: Arc<SupervisorState>,
    process: AsyncMutex<Option<ProxyProcess>>,
}

/// Proxy core supervisor
pub struct ProxySupervisor {
    runner: Arc<Runner>,
    /// Held across start/stop/destroy so a teardown and a new run never interleave
    lifecycle: AsyncMutex<()>,
    run: Mutex<Option<RunHandle>>,
    root: CancellationToken,
    destroyed: AtomicBool,
}

impl ProxySupervisor {
    pub fn new(
        config: SupervisorConfig,
        source: Arc<dyn CandidateSource>,
        pool: ServerPool,
        check: Arc<dyn ConnectivityCheck>,
    ) -> Self {
        let executable = resolve_executable(&config.executable);

        ProxySupervisor {
            runner: Arc::new(Runner {
                config,
                executable,
                source,
                pool,
                check,
                state: Arc::new(SupervisorState::new()),
                process: AsyncMutex::new(None),
            }),
            lifecycle: AsyncMutex::new(()),
            run: Mutex::new(None),
            root: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Wire the default collaborators from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let source = source_from_config(config)?;
        let pool = ServerPool::tcp(config.probe_timeout());
        let check = Arc::new(EchoCheck::new(
            config.echo_url.clone(),
            config.connectivity_timeout(),
        ));
        Ok(Self::new(SupervisorConfig::from_config(config), source, pool, check))
    }

    /// Shared state, for readers such as the routing decider
    pub fn state(&self) -> Arc<SupervisorState> {
        self.runner.state.clone()
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.runner.state.snapshot()
    }

    pub fn is_ready(&self) -> bool {
        self.runner.state.is_ready()
    }

    pub fn socks_port(&self) -> u16 {
        self.runner.config.socks_port
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.runner.state.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// PID of the current proxy core, if one is running
    pub async fn process_id(&self) -> Option<u32> {
        self.runner.process.lock().await.as_ref().and_then(|p| p.pid())
    }

    /// Start a bootstrap run.
    ///
    /// Returns once the run is launched; watch `subscribe()` or use
    /// `wait_settled()` for the outcome. A call while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }

        let mut run = self.run.lock();
        let state = &self.runner.state;

        if state.is_running() {
            warn!(
                "Supervisor already running (generation {}), ignoring start",
                state.generation()
            );
            return Ok(());
        }

        if let Some(previous) = run.take() {
            previous.cancel.cancel();
        }

        let generation = state.begin();
        info!("Starting proxy bootstrap (generation {})", generation);

        if let Err(e) = check_executable(&self.runner.executable) {
            error!("{}", e);
            state.mark_failed(generation, &e.to_string());
            return Err(e);
        }

        let cancel = self.root.child_token();
        let runner = self.runner.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            runner.run(generation, task_cancel).await;
        });

        *run = Some(RunHandle {
            generation,
            cancel,
            task,
        });
        Ok(())
    }

    /// Tear everything down and clear the state. Safe in any state.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown(Phase::Idle).await;
    }

    /// Stop and refuse any further operation
    pub async fn destroy(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.teardown(Phase::Destroyed).await;
        self.root.cancel();
        info!("Supervisor destroyed");
    }

    /// Wait until the current run reaches a settled phase
    pub async fn wait_settled(&self, limit: Duration) -> Result<SupervisorSnapshot> {
        let mut rx = self.subscribe();
        timeout(limit, rx.wait_for(|phase| phase.is_settled()))
            .await
            .map_err(|_| Error::timeout(format!("supervisor not settled after {:?}", limit)))?
            .map_err(|e| Error::internal(e.to_string()))?;
        Ok(self.snapshot())
    }

    async fn teardown(&self, final_phase: Phase) {
        let run = self.run.lock().take();
        if let Some(mut run) = run {
            debug!("Cancelling run for generation {}", run.generation);
            run.cancel.cancel();
            if timeout(RUN_JOIN_TIMEOUT, &mut run.task).await.is_err() {
                warn!("Controlling task did not stop within {:?}, aborting", RUN_JOIN_TIMEOUT);
                run.task.abort();
            }
        }

        let process = self.runner.process.lock().await.take();
        if let Some(process) = process {
            if let Err(e) = process.shutdown(self.runner.config.kill_grace).await {
                warn!("{}", e);
            }
        }

        let config_path = &self.runner.config.config_path;
        match tokio::fs::remove_file(config_path).await {
            Ok(()) => debug!("Removed {:?}", config_path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("{}", Error::teardown(format!("remove {:?}: {}", config_path, e))),
        }

        self.runner.state.reset(final_phase);
        info!("Proxy bootstrap stopped");
    }
}

impl Drop for ProxySupervisor {
    fn drop(&mut self) {
        // Any child left in the slot is killed on drop due to kill_on_drop(true)
        self.root.cancel();
    }
}

impl Runner {
    async fn run(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        match self.bootstrap(generation, &cancel).await {
            Ok(host) => {
                info!("Proxy ready via {} on port {}", host, self.config.socks_port);
                self.watchdog(generation, &cancel).await;
            }
            Err(_) if cancel.is_cancelled() => {
                debug!("Run for generation {} cancelled", generation);
            }
            Err(e) => {
                error!("Proxy bootstrap failed: {}", e);
                self.state.mark_failed(generation, &e.to_string());
            }
        }
    }

    /// Fetch, rank and try candidates. Returns the host that became active.
    async fn bootstrap(&self, generation: u64, cancel: &CancellationToken) -> Result<String> {
        let descriptors = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::internal("cancelled")),
            fetched = self.source.fetch() => fetched?,
        };

        let ranked = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::internal("cancelled")),
            ranked = self.pool.rank(&descriptors) => ranked,
        };

        if ranked.is_empty() {
            return Err(Error::no_servers(format!(
                "none of {} candidates answered within {:?}",
                descriptors.len(),
                self.pool.timeout()
            )));
        }

        let total = ranked.len();
        let mut last_error = None;

        for (index, candidate) in ranked.into_iter().enumerate() {
            if cancel.is_cancelled() || !self.state.is_current(generation) {
                return Err(Error::internal("cancelled"));
            }

            info!("Trying candidate {}/{}: {}", index + 1, total, candidate);
            match self.try_candidate(generation, &candidate, cancel).await {
                Ok(host) => return Ok(host),
                Err(e) if e.is_candidate_failure() => {
                    warn!("Candidate {} failed: {}", candidate, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(Error::no_servers(format!(
            "all {} ranked candidates failed, last error: {}",
            total, reason
        )))
    }

    async fn try_candidate(
        &self,
        generation: u64,
        candidate: &ServerDescriptor,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.state.set_phase(generation, Phase::ConfiguringCandidate);

        // A listener we did not start would pass every readiness stage
        if port_accepting(self.config.socks_port, PORT_CHECK_TIMEOUT).await {
            return Err(Error::port_in_use(format!(
                "127.0.0.1:{} is already accepting connections",
                self.config.socks_port
            )));
        }

        let config = sanitize(candidate, self.config.socks_port);
        config
            .write_to_file(&self.config.config_path)
            .await
            .map_err(|e| Error::config(format!("write {:?}: {}", self.config.config_path, e)))?;

        self.state.set_phase(generation, Phase::LaunchingProcess);
        let mut process = ProxyProcess::spawn(&self.executable, &self.config.config_path, cancel)?;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(Error::internal("cancelled")),
            probed = self.await_ready(generation, &mut process) => probed,
        };

        match outcome {
            Ok(exit_ip) => {
                let mut slot = self.process.lock().await;
                if !self.state.mark_ready(generation, &candidate.host, exit_ip) {
                    drop(slot);
                    if let Err(e) = process.shutdown(self.config.kill_grace).await {
                        warn!("{}", e);
                    }
                    return Err(Error::internal("superseded by a newer run"));
                }
                *slot = Some(process);
                Ok(candidate.host.clone())
            }
            Err(e) => {
                if let Err(teardown) = process.shutdown(self.config.kill_grace).await {
                    warn!("{}", teardown);
                }
                Err(e)
            }
        }
    }

    /// Port poll, then the end-to-end request. Returns the echoed exit address.
    async fn await_ready(&self, generation: u64, process: &mut ProxyProcess) -> Result<Option<String>> {
        self.state.set_phase(generation, Phase::AwaitingPortReady);
        wait_for_port(
            self.config.socks_port,
            self.config.port_poll_interval,
            self.config.port_ready_timeout,
            || process.has_exited(),
        )
        .await?;

        if process.has_exited() {
            return Err(Error::proxy_not_ready(format!(
                "proxy core exited while port {} opened",
                self.config.socks_port
            )));
        }

        self.state.set_phase(generation, Phase::TestingConnectivity);
        let echo = self.check.check(self.config.socks_port).await?;
        Ok(Some(echo).filter(|s| !s.is_empty()))
    }

    /// Watch a ready core; if it dies the run fails so routing falls back to direct.
    async fn watchdog(&self, generation: u64, cancel: &CancellationToken) {
        let mut ticker = interval(WATCHDOG_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let mut slot = self.process.lock().await;
                    let exited = match slot.as_mut() {
                        Some(process) => process.has_exited(),
                        None => break,
                    };
                    if exited {
                        let process = slot.take();
                        drop(slot);
                        error!("Proxy core exited unexpectedly");
                        if let Some(process) = process {
                            if let Err(e) = process.shutdown(self.config.kill_grace).await {
                                warn!("{}", e);
                            }
                        }
                        self.state.mark_failed(generation, "proxy core exited unexpectedly");
                        break;
                    }
                }
            }
        }
    }
}
