use crate::collectors::decoder;
use crate::collectors::session::RemoteExecutor;
use crate::metrics::Metrics;
use crate::profile::ConnectionProfile;
use crate::state::{now_unix, ApplyResult, NodeOutcome, NodeStatus, SharedFleet};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum PollerCommand {
    Upsert(Vec<ConnectionProfile>),
    Remove(Uuid),
    SetInterval(Duration),
}

#[derive(Debug, Error)]
#[error("poller is not running")]
pub struct PollerClosed;

#[derive(Debug, Clone)]
pub struct PollerHandle {
    tx: mpsc::UnboundedSender<PollerCommand>,
}

impl PollerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PollerCommand>) -> Self {
        Self { tx }
    }

    pub fn upsert(&self, profiles: Vec<ConnectionProfile>) -> Result<(), PollerClosed> {
        self.send(PollerCommand::Upsert(profiles))
    }

    pub fn remove(&self, id: Uuid) -> Result<(), PollerClosed> {
        self.send(PollerCommand::Remove(id))
    }

    pub fn set_interval(&self, interval: Duration) -> Result<(), PollerClosed> {
        self.send(PollerCommand::SetInterval(interval))
    }

    fn send(&self, command: PollerCommand) -> Result<(), PollerClosed> {
        self.tx.send(command).map_err(|_| PollerClosed)
    }
}

struct PollResult {
    id: Uuid,
    generation: u64,
    elapsed_ms: u64,
    outcome: Result<String, String>,
}

pub struct Poller {
    executor: Arc<dyn RemoteExecutor>,
    metrics: Arc<Metrics>,
    state: SharedFleet,
    script: Arc<str>,
    interval: Duration,
    in_flight: HashSet<Uuid>,
    commands: mpsc::UnboundedReceiver<PollerCommand>,
    results_tx: mpsc::UnboundedSender<PollResult>,
    results_rx: mpsc::UnboundedReceiver<PollResult>,
}

impl Poller {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        metrics: Arc<Metrics>,
        state: SharedFleet,
        script: impl Into<Arc<str>>,
        interval: Duration,
    ) -> (Self, PollerHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let poller = Self {
            executor,
            metrics,
            state,
            script: script.into(),
            interval,
            in_flight: HashSet::new(),
            commands,
            results_tx,
            results_rx,
        };
        (poller, PollerHandle::new(tx))
    }

    /// Registers profiles before the loop starts.
    pub async fn register(&mut self, profiles: Vec<ConnectionProfile>) {
        self.upsert(profiles).await;
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        {
            let mut guard = self.state.write().await;
            guard.interval_secs = self.interval.as_secs();
        }
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown signal received, stopping poll loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.start_cycle().await;
                }
                Some(result) = self.results_rx.recv() => {
                    self.merge(result).await;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        info!("all poller handles dropped, stopping poll loop");
                        break;
                    };
                    if let Some(interval) = self.handle_command(command).await {
                        ticker = time::interval_at(time::Instant::now() + interval, interval);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
            }
        }
    }

    /// Applies a command and returns the new interval when it changed.
    async fn handle_command(&mut self, command: PollerCommand) -> Option<Duration> {
        match command {
            PollerCommand::Upsert(profiles) => {
                self.upsert(profiles).await;
                None
            }
            PollerCommand::Remove(id) => {
                let removed = {
                    let mut guard = self.state.write().await;
                    let removed = guard.remove(id);
                    self.metrics.update_from_fleet(&guard);
                    removed
                };
                match removed {
                    Some(entry) => {
                        info!(node = %entry.profile.display_name(), "node removed");
                        let executor = Arc::clone(&self.executor);
                        tokio::spawn(async move { executor.release(&entry.profile).await });
                    }
                    None => debug!(%id, "remove for unknown node ignored"),
                }
                None
            }
            PollerCommand::SetInterval(interval) => {
                let interval = interval.max(Duration::from_secs(1));
                if interval == self.interval {
                    return None;
                }
                self.interval = interval;
                self.state.write().await.interval_secs = interval.as_secs();
                info!(interval = %humantime::format_duration(interval), "poll interval changed");
                Some(interval)
            }
        }
    }

    async fn upsert(&mut self, profiles: Vec<ConnectionProfile>) {
        let mut guard = self.state.write().await;
        for profile in profiles {
            if let Err(err) = profile.validate() {
                warn!(error = %err, "profile rejected");
                continue;
            }
            let name = profile.display_name().to_string();
            let registration = guard.upsert_profile(profile);
            if registration.added {
                info!(node = %name, id = %registration.id, "node registered");
            } else {
                debug!(node = %name, id = %registration.id, "node profile updated");
            }
        }
        self.metrics.update_from_fleet(&guard);
    }

    async fn start_cycle(&mut self) {
        let targets = {
            let mut guard = self.state.write().await;
            guard.last_cycle_unix = now_unix();
            guard.targets()
        };
        self.metrics.inc_poll_cycle();

        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move { executor.evict_idle().await });

        for (profile, generation) in targets {
            if !self.in_flight.insert(profile.id) {
                debug!(node = %profile.display_name(), "previous poll still running, skipping");
                continue;
            }
            let executor = Arc::clone(&self.executor);
            let script = Arc::clone(&self.script);
            let results = self.results_tx.clone();
            tokio::spawn(async move {
                let id = profile.id;
                let started = Instant::now();
                // Runs in its own task so a panic surfaces as a JoinError.
                let run = tokio::spawn(async move {
                    executor
                        .execute(&profile, &script)
                        .await
                        .map_err(|err| err.to_string())
                });
                let outcome = match run.await {
                    Ok(outcome) => outcome,
                    Err(err) if err.is_panic() => Err("collector task panicked".to_string()),
                    Err(err) => Err(format!("collector task failed: {err}")),
                };
                let _ = results.send(PollResult {
                    id,
                    generation,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    outcome,
                });
            });
        }
    }

    async fn merge(&mut self, result: PollResult) {
        self.in_flight.remove(&result.id);
        let now = now_unix();

        let outcome = match result.outcome {
            Ok(raw) => {
                let decoded = decoder::decode(&raw, result.id, now);
                for diagnostic in &decoded.diagnostics {
                    debug!(id = %result.id, %diagnostic, "decode skipped input");
                    self.metrics.inc_decode_dropped(diagnostic.section_label());
                }
                NodeOutcome::Decoded(decoded.snapshot)
            }
            Err(message) => NodeOutcome::Failed(message),
        };
        let error = match &outcome {
            NodeOutcome::Failed(message) => Some(message.clone()),
            NodeOutcome::Decoded(_) => None,
        };

        let mut guard = self.state.write().await;
        let applied = guard.apply_outcome(
            result.id,
            result.generation,
            now,
            result.elapsed_ms,
            outcome,
        );
        match applied {
            ApplyResult::Discarded => {
                debug!(id = %result.id, "result for removed node discarded");
                return;
            }
            ApplyResult::Applied {
                name,
                previous,
                status,
            } => {
                if let Some(error) = &error {
                    self.metrics.inc_poll_error(&result.id.to_string(), &name);
                    if previous != NodeStatus::Errored {
                        warn!(node = %name, error = %error, "node poll failed");
                    } else {
                        debug!(node = %name, error = %error, "node still failing");
                    }
                } else if previous == NodeStatus::Errored {
                    info!(node = %name, "node recovered");
                }
                debug!(node = %name, ?status, elapsed_ms = result.elapsed_ms, "node updated");
            }
        }
        self.metrics.update_from_fleet(&guard);
    }
}
