//! Dunning: scheduled retries of an unpaid renewal invoice.
//!
//! Attempt `i` waits `schedule[i]` after the previous attempt, so the first attempt runs
//! immediately. A matching `PaymentReceived` signal during a wait ends dunning early once
//! the invoice is no longer open; a signal for a still-open invoice leaves the schedule as
//! it was.

use chrono::{DateTime, Utc};

use commerce_billing_core::{BillingError, InvoiceId, InvoiceStatus, Result};

use super::lifecycle::Lifecycle;
use super::{Race, Signal, WorkflowPhase};

/// How dunning ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DunningOutcome {
    /// A dunning attempt collected the invoice.
    Paid,
    /// The invoice was settled, voided or written off outside dunning.
    ResolvedExternally,
    /// Every attempt failed; the invoice is uncollectible.
    Exhausted,
}

impl Lifecycle {
    pub(super) async fn dunning(&mut self, invoice_id: &InvoiceId) -> Result<DunningOutcome> {
        let dunning = self.engine.config().dunning.clone();
        let attempts = dunning.attempts();
        let start = usize::try_from(self.run.dunning_attempt).unwrap_or(attempts);

        for attempt in start..attempts {
            let invoice = self
                .activity("load_invoice", invoice_id.clone(), |e, id| e.get_invoice(id))
                .await?;
            if invoice.status != InvoiceStatus::Open {
                return Ok(DunningOutcome::ResolvedExternally);
            }

            let delay = dunning.delay(attempt);
            if !delay.is_zero() {
                let since = invoice.last_attempt_at.unwrap_or_else(|| self.engine.now());
                let deadline = since
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                self.checkpoint(WorkflowPhase::Dunning, Some(deadline))?;

                if self.await_attempt(invoice_id, attempt, deadline).await? {
                    return Ok(DunningOutcome::ResolvedExternally);
                }
            }

            let collected = self
                .activity("collect_invoice", invoice_id.clone(), |e, id| {
                    e.collect_invoice(id)
                })
                .await;
            match collected {
                Ok(result) if result.success => {
                    self.activity("reactivate_subscription", self.id.clone(), |e, id| {
                        e.reactivate_subscription(id)
                    })
                    .await?;
                    tracing::info!(
                        subscription_id = %self.id,
                        invoice_id = %invoice_id,
                        attempt,
                        "Dunning collected invoice"
                    );
                    return Ok(DunningOutcome::Paid);
                }
                Ok(result) => {
                    tracing::warn!(
                        subscription_id = %self.id,
                        invoice_id = %invoice_id,
                        attempt,
                        remaining = result.remaining,
                        message = ?result.message,
                        "Dunning attempt failed"
                    );
                }
                Err(BillingError::InvalidState { .. }) => {
                    return Ok(DunningOutcome::ResolvedExternally);
                }
                Err(e) => return Err(e),
            }

            let next = attempt + 1;
            let wake_at = if next < attempts {
                let at = self.engine.now()
                    + chrono::Duration::from_std(dunning.delay(next))
                        .unwrap_or_else(|_| chrono::Duration::zero());
                self.activity(
                    "record_next_attempt",
                    (invoice_id.clone(), at),
                    |e, (id, at)| e.record_next_attempt(id, *at),
                )
                .await?;
                Some(at)
            } else {
                None
            };
            self.run.dunning_attempt = u32::try_from(next).unwrap_or(u32::MAX);
            self.checkpoint(WorkflowPhase::Dunning, wake_at)?;
        }

        self.activity(
            "fail_dunning",
            (self.id.clone(), invoice_id.clone()),
            |e, (id, invoice_id)| e.fail_dunning(id, invoice_id),
        )
        .await?;
        Ok(DunningOutcome::Exhausted)
    }

    /// Wait for the next attempt's deadline.
    ///
    /// Returns `true` when a `PaymentReceived` signal arrived and the invoice is no longer
    /// open. A signal for an invoice that is still open is logged and the same deadline is
    /// raced again.
    async fn await_attempt(
        &mut self,
        invoice_id: &InvoiceId,
        attempt: usize,
        deadline: DateTime<Utc>,
    ) -> Result<bool> {
        let paid_signal = |signal: &Signal| {
            matches!(
                signal,
                Signal::PaymentReceived { invoice_id: paid } if paid == invoice_id
            )
        };

        loop {
            let race = self.inbox.race_timer(deadline, &paid_signal).await;
            if matches!(race, Race::Timer) {
                return Ok(false);
            }
            let invoice = self
                .activity("load_invoice", invoice_id.clone(), |e, id| e.get_invoice(id))
                .await?;
            if invoice.status != InvoiceStatus::Open {
                tracing::info!(
                    subscription_id = %self.id,
                    invoice_id = %invoice_id,
                    attempt,
                    status = ?invoice.status,
                    "Payment received, dunning stopped"
                );
                return Ok(true);
            }
            tracing::warn!(
                subscription_id = %self.id,
                invoice_id = %invoice_id,
                attempt,
                "Payment signal for an open invoice, dunning continues"
            );
        }
    }
}
