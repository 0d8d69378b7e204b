//! Durable subscription workflows.
//!
//! Every subscription gets one tokio task running the lifecycle workflow: trial expiry,
//! then a renewal loop that falls into dunning when a renewal invoice cannot be collected.
//!
//! # Durability
//!
//! A workflow only suspends in [`SignalInbox::race_timer`], and before each suspension it
//! checkpoints a [`WorkflowRun`] (phase, absolute wake-up time, dunning progress). Its state
//! changes all happen in idempotent activities (see [`activities`]) run on the
//! blocking pool through
//! [`run_blocking_activity`](crate::retry::run_blocking_activity). After a restart,
//! [`WorkflowRunner::resume_all`] starts a task for every unfinished run and the workflow
//! picks up at its last checkpoint; a timer already past its deadline fires immediately.
//!
//! # Signals
//!
//! Callers steer a running workflow with [`Signal`]s through [`WorkflowRunner::signal`]. A
//! signal the current suspension point does not accept is deferred and replayed at the next
//! one that does.

pub mod activities;
mod dunning;
mod lifecycle;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use commerce_billing_core::{
    BillingError, InvoiceId, Plan, Result, Subscription, SubscriptionId, WorkflowRunId,
};
use commerce_billing_store::{kind, Entity, StoreExt};

use crate::clock::Clock;
use crate::engine::BillingEngine;
use crate::subscriptions::NewSubscription;

pub use activities::RenewalOutcome;
pub use dunning::DunningOutcome;

// =============================================================================
// Signals
// =============================================================================

/// An external event delivered to a running workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Cancel the subscription.
    Cancel {
        /// Cancel when the current period ends instead of now.
        at_period_end: bool,
    },
    /// Switch to another plan.
    ChangePlan {
        /// The new plan.
        plan: Plan,
        /// Bill the difference for the rest of the period.
        prorate: bool,
    },
    /// An invoice was paid outside the engine's collection.
    PaymentReceived {
        /// The paid invoice.
        invoice_id: InvoiceId,
    },
}

/// Which side of a [`SignalInbox::race_timer`] won.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Race {
    Timer,
    Signal(Signal),
}

/// A workflow's signal channel plus the signals it has not consumed yet.
pub(crate) struct SignalInbox {
    receiver: mpsc::UnboundedReceiver<Signal>,
    deferred: VecDeque<Signal>,
    clock: Arc<dyn Clock>,
    closed: bool,
}

impl SignalInbox {
    fn new(receiver: mpsc::UnboundedReceiver<Signal>, clock: Arc<dyn Clock>) -> Self {
        Self {
            receiver,
            deferred: VecDeque::new(),
            clock,
            closed: false,
        }
    }

    /// Wait for the earlier of `deadline` and a signal `accept` takes.
    ///
    /// Deferred signals are offered first. Signals `accept` refuses are deferred. The losing
    /// timer is dropped and never fires.
    pub(crate) async fn race_timer(
        &mut self,
        deadline: DateTime<Utc>,
        accept: impl Fn(&Signal) -> bool,
    ) -> Race {
        let replay = self.deferred.iter().position(&accept);
        if let Some(signal) = replay.and_then(|index| self.deferred.remove(index)) {
            return Race::Signal(signal);
        }

        let timer = tokio::time::sleep_until(self.clock.instant_at(deadline));
        tokio::pin!(timer);
        loop {
            tokio::select! {
                () = &mut timer => return Race::Timer,
                received = self.receiver.recv(), if !self.closed => match received {
                    Some(signal) if accept(&signal) => return Race::Signal(signal),
                    Some(signal) => {
                        tracing::debug!(?signal, "Signal deferred");
                        self.deferred.push_back(signal);
                    }
                    None => self.closed = true,
                },
            }
        }
    }
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Where a workflow is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    /// Waiting for the trial to end.
    Trial,
    /// Waiting for the period to end.
    Renewal,
    /// Retrying an unpaid renewal invoice.
    Dunning,
    /// Finished.
    Completed,
}

/// How a lifecycle workflow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleOutcome {
    /// The subscription was canceled.
    Canceled,
    /// Dunning gave up; the subscription is unpaid.
    Unpaid,
}

/// Persisted progress of one subscription's workflow, keyed by subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run identifier.
    pub id: WorkflowRunId,
    /// The subscription driven.
    pub subscription_id: SubscriptionId,
    /// Current phase.
    pub phase: WorkflowPhase,
    /// When the pending timer fires.
    pub wake_at: Option<DateTime<Utc>>,
    /// Invoice under dunning.
    pub dunning_invoice_id: Option<InvoiceId>,
    /// Index of the next dunning attempt.
    pub dunning_attempt: u32,
    /// Final outcome once completed.
    pub outcome: Option<LifecycleOutcome>,
    /// When the run started.
    pub created_at: DateTime<Utc>,
    /// Last checkpoint.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    fn new(subscription_id: SubscriptionId, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkflowRunId::generate(),
            subscription_id,
            phase: WorkflowPhase::Renewal,
            wake_at: None,
            dunning_invoice_id: None,
            dunning_attempt: 0,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for WorkflowRun {
    const KIND: &'static str = kind::WORKFLOW_RUN;

    fn key(&self) -> String {
        self.subscription_id.to_string()
    }
}

// =============================================================================
// Runner
// =============================================================================

struct WorkflowHandle {
    sender: mpsc::UnboundedSender<Signal>,
    task: Option<JoinHandle<Result<LifecycleOutcome>>>,
}

/// Spawns and tracks lifecycle workflows.
///
/// Cheap to clone; clones share the set of running workflows.
#[derive(Clone)]
pub struct WorkflowRunner {
    engine: BillingEngine,
    workflows: Arc<Mutex<HashMap<SubscriptionId, WorkflowHandle>>>,
}

impl WorkflowRunner {
    /// Create a runner over `engine`.
    #[must_use]
    pub fn new(engine: BillingEngine) -> Self {
        Self {
            engine,
            workflows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The engine the workflows run against.
    #[must_use]
    pub fn engine(&self) -> &BillingEngine {
        &self.engine
    }

    /// Create a subscription and start its lifecycle workflow.
    ///
    /// # Errors
    ///
    /// - Any error of [`BillingEngine::start_subscription`].
    /// - `Configuration` when called outside a tokio runtime.
    pub fn start_subscription(&self, params: NewSubscription) -> Result<Subscription> {
        let runtime = runtime()?;
        let sub = self.engine.start_subscription(params)?;
        self.spawn(&runtime, sub.id.clone());
        Ok(sub)
    }

    /// Deliver a signal to a subscription's workflow.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no workflow is running for the subscription.
    pub fn signal(&self, subscription_id: &SubscriptionId, signal: Signal) -> Result<()> {
        let workflows = self.lock();
        let handle = workflows
            .get(subscription_id)
            .ok_or_else(|| BillingError::not_found("workflow", subscription_id))?;
        tracing::debug!(subscription_id = %subscription_id, ?signal, "Signal sent");
        handle
            .sender
            .send(signal)
            .map_err(|_| BillingError::not_found("workflow", subscription_id))
    }

    /// Whether a workflow task for the subscription is still running.
    #[must_use]
    pub fn is_running(&self, subscription_id: &SubscriptionId) -> bool {
        self.lock()
            .get(subscription_id)
            .and_then(|handle| handle.task.as_ref())
            .is_some_and(|task| !task.is_finished())
    }

    /// Start workflows for every subscription whose run has not completed.
    ///
    /// Subscriptions without a run (created just before a crash) are resumed as well, unless
    /// they already ended. Returns the number of workflows started.
    ///
    /// # Errors
    ///
    /// - A storage error if runs or subscriptions cannot be read.
    /// - `Configuration` when called outside a tokio runtime.
    pub fn resume_all(&self) -> Result<usize> {
        let runtime = runtime()?;
        let store = self.engine.store();
        let runs: HashMap<SubscriptionId, WorkflowRun> = store
            .get_all::<WorkflowRun>()?
            .into_iter()
            .map(|run| (run.subscription_id.clone(), run))
            .collect();

        let mut resumed = 0;
        for sub in store.get_all::<Subscription>()? {
            let pending = match runs.get(&sub.id) {
                Some(run) => run.phase != WorkflowPhase::Completed,
                None => !sub.status.is_terminal(),
            };
            if pending && !self.is_running(&sub.id) {
                self.spawn(&runtime, sub.id);
                resumed += 1;
            }
        }
        tracing::info!(resumed, "Workflows resumed");
        Ok(resumed)
    }

    /// Wait for a subscription's workflow to finish.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no workflow was started for the subscription, or it is already
    ///   being waited on.
    /// - The workflow's own error, or `External` if its task panicked or was aborted.
    pub async fn wait(&self, subscription_id: &SubscriptionId) -> Result<LifecycleOutcome> {
        let task = self
            .lock()
            .get_mut(subscription_id)
            .and_then(|handle| handle.task.take())
            .ok_or_else(|| BillingError::not_found("workflow", subscription_id))?;
        task.await
            .map_err(|e| BillingError::external("workflow", e.to_string()))?
    }

    /// Abort every running workflow. Their checkpoints stay in the store for
    /// [`resume_all`](Self::resume_all).
    pub fn shutdown(&self) {
        let mut workflows = self.lock();
        for handle in workflows.values() {
            if let Some(task) = &handle.task {
                task.abort();
            }
        }
        tracing::info!(workflows = workflows.len(), "Workflows stopped");
        workflows.clear();
    }

    fn spawn(&self, runtime: &tokio::runtime::Handle, subscription_id: SubscriptionId) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inbox = SignalInbox::new(receiver, Arc::clone(self.engine.clock()));
        let task = runtime.spawn(lifecycle::run_lifecycle(
            self.engine.clone(),
            subscription_id.clone(),
            inbox,
        ));
        tracing::debug!(subscription_id = %subscription_id, "Workflow started");
        self.lock().insert(
            subscription_id,
            WorkflowHandle {
                sender,
                task: Some(task),
            },
        );
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, WorkflowHandle>> {
        self.workflows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn runtime() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().map_err(|e| {
        BillingError::Configuration(format!("workflows need a tokio runtime: {e}"))
    })
}
