//! Deployment coordinator
//!
//! The coordinator owns every status and log write of a run. Triggers are
//! accepted from request handlers; the pipeline itself runs on the blocking
//! pool and reports back through a channel that [`run`] drains on the server
//! loop, so persisted state is only touched from async context.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::deploy::executor::{PipelineExecutor, RunOutcome};
use crate::deploy::fsm::{RunEvent, RunFsm};
use crate::errors::DeployError;
use crate::models::deployment::{Deployment, DeploymentMode, DeploymentStatus, RunKind};
use crate::models::history::HistoryEntry;
use crate::notify::dispatcher::NotificationDispatcher;
use crate::storage::history::HistoryStore;
use crate::storage::store::DeploymentStore;
use crate::stream::broadcaster::LogBroadcaster;
use crate::stream::frame::StreamFrame;
use crate::utils::generate_uuid;

/// Worker to loop hand-off
#[derive(Debug)]
pub enum RunMessage {
    /// Cumulative log after a pipeline step
    Update { id: String, log: String },

    /// The worker returned
    Complete {
        id: String,
        kind: RunKind,
        outcome: RunOutcome,
    },

    /// The worker panicked or was cancelled
    Crashed {
        id: String,
        kind: RunKind,
        error: String,
    },
}

pub struct Coordinator {
    store: Arc<dyn DeploymentStore>,
    history: Arc<HistoryStore>,
    broadcaster: Arc<LogBroadcaster>,
    notifier: Arc<NotificationDispatcher>,
    executor: Arc<PipelineExecutor>,
    active: Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<RunMessage>,
}

impl Coordinator {
    /// Build a coordinator and the receiving end [`run`] must drain
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        history: Arc<HistoryStore>,
        broadcaster: Arc<LogBroadcaster>,
        notifier: Arc<NotificationDispatcher>,
        executor: Arc<PipelineExecutor>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RunMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Arc::new(Self {
            store,
            history,
            broadcaster,
            notifier,
            executor,
            active: Mutex::new(HashSet::new()),
            tx,
        });
        (coordinator, rx)
    }

    pub fn store(&self) -> &Arc<dyn DeploymentStore> {
        &self.store
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn broadcaster(&self) -> &Arc<LogBroadcaster> {
        &self.broadcaster
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    fn release(&self, id: &str) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    // ================================ TRIGGER ==================================== //

    /// Start a run unless one is already in flight for `id`. Returns once the
    /// run is persisted as `running` and handed to a worker.
    pub async fn trigger(&self, id: &str, kind: RunKind) -> Result<(), DeployError> {
        let deployment = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;

        if let RunKind::Rollback { image_tag } = &kind {
            self.validate_rollback(&deployment, image_tag).await?;
        }

        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if !active.insert(id.to_string()) {
                return Err(DeployError::AlreadyRunning(id.to_string()));
            }
        }

        match self.start(id, &kind).await {
            Ok(deployment) => {
                self.spawn_run(deployment, kind);
                Ok(())
            }
            Err(e) => {
                self.release(id);
                Err(e)
            }
        }
    }

    async fn validate_rollback(&self, deployment: &Deployment, image_tag: &str) -> Result<(), DeployError> {
        if deployment.mode != DeploymentMode::Swarm {
            return Err(DeployError::ValidationError(
                "rollback is only available for swarm deployments".to_string(),
            ));
        }
        let known = self
            .history
            .list(&deployment.id)
            .await?
            .iter()
            .any(|entry| {
                entry.status == DeploymentStatus::Success
                    && entry.image_tag.as_deref() == Some(image_tag)
            });
        if !known {
            return Err(DeployError::ValidationError(format!(
                "{} is not a successfully deployed image of this deployment",
                image_tag
            )));
        }
        Ok(())
    }

    /// Persist the transition to `running` with a fresh log
    async fn start(&self, id: &str, kind: &RunKind) -> Result<Deployment, DeployError> {
        let initial = match kind {
            RunKind::Deploy => format!("==> [queued] Deployment started at {}\n", Utc::now().to_rfc3339()),
            RunKind::Rollback { image_tag } => format!(
                "==> [queued] Rollback to {} started at {}\n",
                image_tag,
                Utc::now().to_rfc3339()
            ),
        };

        let mut rejected = None;
        let updated = self
            .store
            .update(
                id,
                Box::new(|d: &mut Deployment| {
                    let mut fsm = RunFsm::new(d.status);
                    match fsm.process(RunEvent::Trigger) {
                        Ok(()) => {
                            d.status = fsm.state();
                            d.logs = initial;
                        }
                        Err(e) => rejected = Some(e),
                    }
                }),
            )
            .await?;

        if let Some(reason) = rejected {
            debug!("Trigger of {} rejected: {}", id, reason);
            return Err(DeployError::AlreadyRunning(id.to_string()));
        }
        let deployment = updated.ok_or_else(|| DeployError::NotFound(format!("deployment {}", id)))?;

        info!("Deployment {} ({}) is running", deployment.name, id);
        self.broadcaster
            .publish(id, &StreamFrame::update(&deployment.logs, deployment.status));
        Ok(deployment)
    }

    fn spawn_run(&self, deployment: Deployment, kind: RunKind) {
        let id = deployment.id.clone();
        let executor = self.executor.clone();
        let worker_tx = self.tx.clone();
        let worker_kind = kind.clone();
        let initial = deployment.logs.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let id = deployment.id.clone();
            let mut on_update = |log: &str| {
                let _ = worker_tx.send(RunMessage::Update {
                    id: id.clone(),
                    log: log.to_string(),
                });
            };
            executor.run(&deployment, &worker_kind, &initial, &mut on_update)
        });

        // Queued after every update of the run
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let message = match handle.await {
                Ok(outcome) => RunMessage::Complete { id, kind, outcome },
                Err(e) => RunMessage::Crashed {
                    id,
                    kind,
                    error: describe_join_error(e),
                },
            };
            if tx.send(message).is_err() {
                error!("Coordinator loop is gone, run result dropped");
            }
        });
    }

    // ================================ EVENTS ===================================== //

    /// Persist the cumulative log and forward it to subscribers
    pub async fn on_stage_update(&self, id: &str, log: String) {
        let persisted = log.clone();
        match self.store.update(id, Box::new(move |d: &mut Deployment| d.logs = persisted)).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!("Deployment {} deleted mid-run, log update dropped", id),
            Err(e) => warn!("Failed to persist log of {}: {}", id, e),
        }
        self.broadcaster
            .publish(id, &StreamFrame::update(&log, DeploymentStatus::Running));
    }

    /// Persist the terminal state, record history, broadcast `final` and
    /// notify in the background
    pub async fn on_complete(&self, id: &str, kind: RunKind, outcome: RunOutcome) {
        let status = if outcome.success {
            DeploymentStatus::Success
        } else {
            DeploymentStatus::Failed
        };
        let finished_at = Utc::now();

        let result = self
            .store
            .update(
                id,
                Box::new(|d: &mut Deployment| {
                    let mut fsm = RunFsm::new(d.status);
                    let event = if outcome.success {
                        RunEvent::Succeed
                    } else {
                        RunEvent::Fail("pipeline failed".to_string())
                    };
                    if let Err(e) = fsm.process(event) {
                        warn!("Completing {}: {}", d.id, e);
                    }
                    d.status = status;
                    d.logs = outcome.log.clone();
                    d.deploy_count += 1;
                    d.last_deployed_at = Some(finished_at);
                    if let Some(commit) = &outcome.commit_hash {
                        d.last_commit = Some(commit.clone());
                    }
                    if let Some(image) = &outcome.image_tag {
                        d.last_image = Some(image.clone());
                    }
                }),
            )
            .await;

        let updated = match result {
            Ok(updated) => updated,
            Err(e) => {
                error!("Failed to persist completion of {}: {}", id, e);
                None
            }
        };

        self.broadcaster
            .publish(id, &StreamFrame::final_state(&outcome.log, status));
        self.release(id);

        let Some(deployment) = updated else {
            debug!("Deployment {} deleted mid-run, final write dropped", id);
            return;
        };

        let entry = HistoryEntry {
            id: generate_uuid(),
            deployment_id: id.to_string(),
            kind: kind.as_str().to_string(),
            status,
            commit_hash: outcome.commit_hash.clone(),
            image_tag: outcome.image_tag.clone(),
            deployed_at: finished_at,
        };
        if let Err(e) = self.history.append(entry).await {
            warn!("Failed to record history of {}: {}", id, e);
        }

        info!("Deployment {} finished: {}", id, status);
        self.notifier.dispatch(deployment);
    }

    /// Fail a run whose worker never returned an outcome
    pub async fn on_exception(&self, id: &str, kind: RunKind, error: &str) {
        error!("Pipeline worker for {} crashed: {}", id, error);
        let mut log = match self.store.get(id).await {
            Ok(Some(d)) => d.logs,
            _ => String::new(),
        };
        if !log.is_empty() && !log.ends_with('\n') {
            log.push('\n');
        }
        log.push_str(&format!("ERROR: pipeline worker crashed: {}\n", error));
        log.push_str("==> [failed] Deployment failed\n");

        let outcome = RunOutcome {
            success: false,
            log,
            commit_hash: None,
            image_tag: None,
        };
        self.on_complete(id, kind, outcome).await;
    }

    async fn handle(&self, message: RunMessage) {
        match message {
            RunMessage::Update { id, log } => self.on_stage_update(&id, log).await,
            RunMessage::Complete { id, kind, outcome } => self.on_complete(&id, kind, outcome).await,
            RunMessage::Crashed { id, kind, error } => self.on_exception(&id, kind, &error).await,
        }
    }

    // =============================== LIFECYCLE =================================== //

    /// Fail every record left `running` by a previous process
    pub async fn recover_interrupted(&self) -> Result<usize, DeployError> {
        let mut recovered = 0;
        for deployment in self.store.list().await? {
            if deployment.status != DeploymentStatus::Running || self.is_active(&deployment.id) {
                continue;
            }
            let updated = self
                .store
                .update(
                    &deployment.id,
                    Box::new(|d: &mut Deployment| {
                        let mut fsm = RunFsm::new(d.status);
                        if fsm.process(RunEvent::Abandon).is_ok() {
                            if !d.logs.is_empty() && !d.logs.ends_with('\n') {
                                d.logs.push('\n');
                            }
                            d.logs.push_str(&format!(
                                "ERROR: {}\n==> [failed] Deployment failed\n",
                                fsm.error().unwrap_or("interrupted")
                            ));
                            d.status = fsm.state();
                        }
                    }),
                )
                .await?;
            if updated.is_some() {
                warn!("Marked interrupted run of {} as failed", deployment.id);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Remove a deployment and its history; an in-flight run keeps going
    pub async fn delete(&self, id: &str) -> Result<bool, DeployError> {
        let removed = self.store.delete(id).await?;
        if removed {
            self.history.delete(id).await?;
            info!("Deleted deployment {}", id);
        }
        Ok(removed)
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        if let Some(msg) = payload.downcast_ref::<&str>() {
            format!("panic: {}", msg)
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            format!("panic: {}", msg)
        } else {
            "panic".to_string()
        }
    } else {
        err.to_string()
    }
}

/// Drain worker messages until shutdown
pub async fn run(
    coordinator: Arc<Coordinator>,
    mut messages: mpsc::UnboundedReceiver<RunMessage>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Coordinator loop starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Coordinator loop shutting down...");
                return;
            }
            message = messages.recv() => {
                match message {
                    Some(message) => {
                        let mut batch = vec![message];
                        while let Ok(next) = messages.try_recv() {
                            batch.push(next);
                        }
                        for message in coalesce(batch) {
                            coordinator.handle(message).await;
                        }
                    }
                    None => {
                        info!("Coordinator channel closed");
                        return;
                    }
                }
            }
        }
    }
}

/// Drop log updates superseded by a later update of the same run within a
/// batch. Updates carry the cumulative log, so only the newest matters.
fn coalesce(batch: Vec<RunMessage>) -> Vec<RunMessage> {
    let mut newer = HashSet::new();
    let mut kept: Vec<RunMessage> = Vec::with_capacity(batch.len());
    for message in batch.into_iter().rev() {
        match &message {
            RunMessage::Update { id, .. } => {
                if !newer.insert(id.clone()) {
                    continue;
                }
            }
            RunMessage::Complete { id, .. } | RunMessage::Crashed { id, .. } => {
                newer.remove(id);
            }
        }
        kept.push(message);
    }
    kept.reverse();
    kept
}
