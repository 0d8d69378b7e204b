//! The subscription lifecycle workflow.

use chrono::{DateTime, Utc};

use commerce_billing_core::{
    InvoiceId, InvoiceStatus, Result, Subscription, SubscriptionId, SubscriptionStatus,
};
use commerce_billing_store::StoreExt;

use super::{DunningOutcome, LifecycleOutcome, Race, Signal, SignalInbox, WorkflowPhase};
use super::WorkflowRun;
use crate::engine::BillingEngine;
use crate::retry::run_blocking_activity;

/// State of one running lifecycle workflow.
pub(super) struct Lifecycle {
    pub(super) engine: BillingEngine,
    pub(super) id: SubscriptionId,
    pub(super) inbox: SignalInbox,
    pub(super) run: WorkflowRun,
}

/// Drive a subscription from its last checkpoint until it ends.
pub(super) async fn run_lifecycle(
    engine: BillingEngine,
    id: SubscriptionId,
    inbox: SignalInbox,
) -> Result<LifecycleOutcome> {
    let run = match engine.store().get::<WorkflowRun>(id.as_str())? {
        Some(run) => run,
        None => WorkflowRun::new(id.clone(), engine.now()),
    };
    let mut lifecycle = Lifecycle {
        engine,
        id,
        inbox,
        run,
    };

    let result = lifecycle.drive().await;
    match &result {
        Ok(outcome) => {
            tracing::info!(subscription_id = %lifecycle.id, ?outcome, "Workflow completed");
        }
        Err(e) => {
            tracing::error!(subscription_id = %lifecycle.id, error = %e, "Workflow failed");
        }
    }
    result
}

impl Lifecycle {
    async fn drive(&mut self) -> Result<LifecycleOutcome> {
        if self.run.phase == WorkflowPhase::Completed {
            return Ok(self.run.outcome.unwrap_or(LifecycleOutcome::Canceled));
        }
        if let Some(outcome) = self.settle_dunning().await? {
            return self.finish(outcome);
        }

        loop {
            let sub = self
                .activity("load_subscription", self.id.clone(), |e, id| {
                    e.get_subscription(id)
                })
                .await?;
            if sub.status.is_terminal() {
                return self.finish(ended(sub.status));
            }

            let step = if let Some(invoice_id) = self.unpaid_renewal(&sub).await? {
                self.run.dunning_invoice_id = Some(invoice_id);
                self.run.dunning_attempt = 0;
                self.checkpoint(WorkflowPhase::Dunning, None)?;
                self.settle_dunning().await?
            } else if sub.status == SubscriptionStatus::Trialing {
                self.trial(&sub).await?
            } else {
                self.period(&sub).await?
            };
            if let Some(outcome) = step {
                return self.finish(outcome);
            }
        }
    }

    async fn trial(&mut self, sub: &Subscription) -> Result<Option<LifecycleOutcome>> {
        let trial_end = sub.trial_end.unwrap_or(sub.current_period_start);
        self.checkpoint(WorkflowPhase::Trial, Some(trial_end))?;

        match self.inbox.race_timer(trial_end, |_| true).await {
            Race::Timer => {
                self.activity("end_trial", self.id.clone(), |e, id| e.end_trial(id))
                    .await?;
            }
            Race::Signal(Signal::Cancel { .. }) => {
                self.activity("cancel_subscription", self.id.clone(), |e, id| {
                    e.cancel_subscription(id, false)
                })
                .await?;
                return Ok(Some(LifecycleOutcome::Canceled));
            }
            Race::Signal(Signal::ChangePlan { plan, .. }) => {
                self.activity("change_plan", (self.id.clone(), plan), |e, (id, plan)| {
                    e.change_subscription_plan(id, plan.clone(), false)
                })
                .await?;
            }
            Race::Signal(Signal::PaymentReceived { invoice_id }) => {
                tracing::info!(
                    subscription_id = %self.id,
                    invoice_id = %invoice_id,
                    "Payment received during trial, ignored"
                );
            }
        }
        Ok(None)
    }

    async fn period(&mut self, sub: &Subscription) -> Result<Option<LifecycleOutcome>> {
        let period_end = sub.current_period_end;
        self.checkpoint(WorkflowPhase::Renewal, Some(period_end))?;

        match self.inbox.race_timer(period_end, |_| true).await {
            Race::Timer => return self.renew().await,
            Race::Signal(Signal::Cancel { at_period_end }) => {
                self.activity(
                    "cancel_subscription",
                    (self.id.clone(), at_period_end),
                    |e, (id, at_period_end)| e.cancel_subscription(id, *at_period_end),
                )
                .await?;
                if !at_period_end {
                    return Ok(Some(LifecycleOutcome::Canceled));
                }
            }
            Race::Signal(Signal::ChangePlan { plan, prorate }) => {
                self.activity(
                    "change_plan",
                    (self.id.clone(), plan, prorate),
                    |e, (id, plan, prorate)| e.change_subscription_plan(id, plan.clone(), *prorate),
                )
                .await?;
            }
            Race::Signal(Signal::PaymentReceived { invoice_id }) => {
                tracing::info!(
                    subscription_id = %self.id,
                    invoice_id = %invoice_id,
                    "Payment received outside dunning, ignored"
                );
            }
        }
        Ok(None)
    }

    /// The period ended: cancel, or apply a queued plan change and renew.
    async fn renew(&mut self) -> Result<Option<LifecycleOutcome>> {
        let sub = self
            .activity("load_subscription", self.id.clone(), |e, id| {
                e.get_subscription(id)
            })
            .await?;
        if sub.status.is_terminal() {
            return Ok(Some(ended(sub.status)));
        }
        if sub.cancel_at_period_end {
            self.activity("cancel_subscription", self.id.clone(), |e, id| {
                e.cancel_subscription(id, false)
            })
            .await?;
            return Ok(Some(LifecycleOutcome::Canceled));
        }

        self.activity("apply_due_schedule", self.id.clone(), |e, id| {
            e.apply_due_schedule(id)
        })
        .await?;
        let renewal = self
            .activity("renew_subscription", self.id.clone(), |e, id| {
                e.renew_subscription(id)
            })
            .await?;
        if !renewal.paid {
            tracing::warn!(
                subscription_id = %self.id,
                invoice_id = %renewal.invoice_id,
                "Renewal not collected, subscription past due"
            );
        }
        Ok(None)
    }

    /// The open renewal invoice of a past-due subscription.
    async fn unpaid_renewal(&self, sub: &Subscription) -> Result<Option<InvoiceId>> {
        if sub.status != SubscriptionStatus::PastDue {
            return Ok(None);
        }
        let Some(invoice_id) = sub.latest_invoice_id.clone() else {
            return Ok(None);
        };
        let invoice = self
            .activity("load_invoice", invoice_id.clone(), |e, id| e.get_invoice(id))
            .await?;
        Ok((invoice.status == InvoiceStatus::Open).then_some(invoice_id))
    }

    /// Run or resume dunning for the checkpointed invoice, if any.
    async fn settle_dunning(&mut self) -> Result<Option<LifecycleOutcome>> {
        let Some(invoice_id) = self.run.dunning_invoice_id.clone() else {
            return Ok(None);
        };

        let outcome = match self.dunning(&invoice_id).await? {
            DunningOutcome::Paid => None,
            DunningOutcome::ResolvedExternally => {
                let invoice = self
                    .activity("load_invoice", invoice_id.clone(), |e, id| e.get_invoice(id))
                    .await?;
                if invoice.status == InvoiceStatus::Paid {
                    self.activity("reactivate_subscription", self.id.clone(), |e, id| {
                        e.reactivate_subscription(id)
                    })
                    .await?;
                }
                None
            }
            DunningOutcome::Exhausted => Some(LifecycleOutcome::Unpaid),
        };

        self.run.dunning_invoice_id = None;
        self.run.dunning_attempt = 0;
        self.checkpoint(WorkflowPhase::Renewal, None)?;
        Ok(outcome)
    }

    /// Run one activity against the engine with the configured timeout and retries.
    ///
    /// `f` runs on the blocking pool with its own handle to the engine, so `arg` carries
    /// everything it needs by value.
    pub(super) async fn activity<A, T>(
        &self,
        name: &str,
        arg: A,
        f: fn(&BillingEngine, &A) -> Result<T>,
    ) -> Result<T>
    where
        A: Send + Sync + 'static,
        T: Send + 'static,
    {
        let engine = self.engine.clone();
        run_blocking_activity(name, &self.engine.config().activity, move || f(&engine, &arg))
            .await
    }

    /// Persist the current suspension point.
    pub(super) fn checkpoint(
        &mut self,
        phase: WorkflowPhase,
        wake_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.run.phase = phase;
        self.run.wake_at = wake_at;
        self.run.updated_at = self.engine.now();
        self.engine.store().put(&self.run)?;
        tracing::debug!(
            subscription_id = %self.id,
            ?phase,
            wake_at = ?wake_at,
            "Workflow checkpoint"
        );
        Ok(())
    }

    fn finish(&mut self, outcome: LifecycleOutcome) -> Result<LifecycleOutcome> {
        self.run.outcome = Some(outcome);
        self.checkpoint(WorkflowPhase::Completed, None)?;
        Ok(outcome)
    }
}

fn ended(status: SubscriptionStatus) -> LifecycleOutcome {
    if status == SubscriptionStatus::Unpaid {
        LifecycleOutcome::Unpaid
    } else {
        LifecycleOutcome::Canceled
    }
}
