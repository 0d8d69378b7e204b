//! Subscription activities.
//!
//! Each activity is one store transaction and safe to repeat: the lifecycle workflow retries
//! activities that hit infrastructure errors, and resumes them after a restart.

use chrono::{DateTime, Utc};

use commerce_billing_core::{
    event_types, BillingError, BillingInvoice, InvoiceId, InvoiceStatus, LineItem, LineItemKind,
    Plan, Result, ScheduleStatus, Subscription, SubscriptionId, SubscriptionItem,
    SubscriptionSchedule, SubscriptionStatus,
};
use commerce_billing_store::StoreExt;

use crate::engine::{BillingEngine, Tx};
use crate::events::snapshot;

/// Outcome of renewing a subscription period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalOutcome {
    /// The invoice for the period.
    pub invoice_id: InvoiceId,
    /// Whether the invoice was collected.
    pub paid: bool,
}

impl BillingEngine {
    /// End a subscription's trial. A subscription no longer trialing is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription does not exist.
    pub fn end_trial(&self, id: &SubscriptionId) -> Result<Subscription> {
        let sub = self.store().transaction(|tx| {
            let mut sub: Subscription = tx.require(id.as_str())?;
            if sub.status != SubscriptionStatus::Trialing {
                return Ok(sub);
            }
            let previous = snapshot(&sub)?;
            sub.end_trial(self.now())?;
            tx.update(&sub)?;
            self.record(tx, event_types::SUBSCRIPTION_TRIAL_ENDED, &sub, Some(previous))?;
            Ok::<_, BillingError>(sub)
        })?;
        self.wake_dispatcher();
        tracing::info!(subscription_id = %id, status = %sub.status, "Trial ended");
        Ok(sub)
    }

    /// Cancel a subscription now or at the end of its period.
    ///
    /// An ended subscription is returned unchanged. Immediate cancellation also releases
    /// any queued plan change.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription does not exist.
    pub fn cancel_subscription(
        &self,
        id: &SubscriptionId,
        at_period_end: bool,
    ) -> Result<Subscription> {
        let sub = self.store().transaction(|tx| {
            let mut sub: Subscription = tx.require(id.as_str())?;
            if sub.status.is_terminal() {
                return Ok(sub);
            }
            let previous = snapshot(&sub)?;
            let now = self.now();
            sub.cancel(at_period_end, now)?;
            tx.update(&sub)?;
            let event_type = if at_period_end {
                event_types::SUBSCRIPTION_UPDATED
            } else {
                release_schedules(tx, &sub.id, now)?;
                event_types::SUBSCRIPTION_DELETED
            };
            self.record(tx, event_type, &sub, Some(previous))?;
            Ok::<_, BillingError>(sub)
        })?;
        self.wake_dispatcher();
        tracing::info!(
            subscription_id = %id,
            at_period_end,
            status = %sub.status,
            "Subscription canceled"
        );
        Ok(sub)
    }

    /// Swap a subscription's plan now.
    ///
    /// With `prorate`, a non-zero proration line for the rest of the period is queued and
    /// billed on the next renewal invoice.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the subscription does not exist.
    /// - `InvalidState` if the subscription has ended.
    pub fn change_subscription_plan(
        &self,
        id: &SubscriptionId,
        plan: Plan,
        prorate: bool,
    ) -> Result<Subscription> {
        let sub = self.store().transaction(|tx| {
            let mut sub: Subscription = tx.require(id.as_str())?;
            self.swap_plan_in(tx, &mut sub, plan, prorate)?;
            Ok::<_, BillingError>(sub)
        })?;
        self.wake_dispatcher();
        tracing::info!(
            subscription_id = %id,
            plan = %sub.plan.id,
            prorate,
            "Subscription plan changed"
        );
        Ok(sub)
    }

    /// Apply the queued plan change of a subscription, if any.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the subscription does not exist.
    /// - `InvalidState` if the subscription has ended.
    pub fn apply_due_schedule(&self, id: &SubscriptionId) -> Result<Option<SubscriptionSchedule>> {
        let applied = self.store().transaction(|tx| {
            let Some(mut schedule) = tx
                .query::<SubscriptionSchedule>(|s| {
                    s.subscription_id == *id && s.status == ScheduleStatus::Active
                })?
                .into_iter()
                .max_by_key(|s| s.created_at)
            else {
                return Ok(None);
            };
            let mut sub: Subscription = tx.require(id.as_str())?;
            self.swap_plan_in(tx, &mut sub, schedule.plan.clone(), schedule.prorate)?;
            schedule.complete(self.now());
            tx.update(&schedule)?;
            Ok::<_, BillingError>(Some(schedule))
        })?;
        if let Some(schedule) = &applied {
            self.wake_dispatcher();
            tracing::info!(
                subscription_id = %id,
                schedule_id = %schedule.id,
                plan = %schedule.plan.id,
                "Scheduled plan change applied"
            );
        }
        Ok(applied)
    }

    /// Invoice the current period, collect it and move to the next period.
    ///
    /// The period is billed in arrears: the invoice carries the plan line for the period
    /// that just ended, queued proration lines, unbilled usage of every item and tax for the
    /// subscription's address. Repeating the call for a period that was already invoiced
    /// reuses that invoice.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the subscription does not exist.
    /// - `InvalidState` if the subscription has ended.
    pub fn renew_subscription(&self, id: &SubscriptionId) -> Result<RenewalOutcome> {
        let sub = self.get_subscription(id)?;
        if sub.status.is_terminal() {
            return Err(BillingError::invalid_state("subscription", sub.status, "renew"));
        }
        let period_start = sub.current_period_start;

        let existing = self
            .store()
            .query::<BillingInvoice>(|i| {
                i.subscription_id.as_ref() == Some(id)
                    && i.period_start == Some(period_start)
                    && i.status != InvoiceStatus::Void
            })?
            .into_iter()
            .next();
        let invoice = match existing {
            Some(invoice) => {
                tracing::debug!(invoice_id = %invoice.id, "Renewal invoice already exists");
                invoice
            }
            None => self.create_renewal_invoice(id)?,
        };

        let paid = match invoice.status {
            InvoiceStatus::Open => self.collect_invoice(&invoice.id)?.success,
            status => status == InvoiceStatus::Paid,
        };

        self.store().transaction(|tx| {
            let mut sub: Subscription = tx.require(id.as_str())?;
            if sub.current_period_start != period_start || sub.status.is_terminal() {
                return Ok(());
            }
            let previous = snapshot(&sub)?;
            sub.advance(paid, self.now());
            tx.update(&sub)?;
            self.record(tx, event_types::SUBSCRIPTION_UPDATED, &sub, Some(previous))
        })?;
        self.wake_dispatcher();

        tracing::info!(
            subscription_id = %id,
            invoice_id = %invoice.id,
            amount_due = invoice.amount_due,
            paid,
            "Subscription renewed"
        );
        Ok(RenewalOutcome {
            invoice_id: invoice.id,
            paid,
        })
    }

    /// Record when the next dunning attempt on an open invoice is due.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the invoice does not exist.
    pub fn record_next_attempt(
        &self,
        invoice_id: &InvoiceId,
        at: DateTime<Utc>,
    ) -> Result<BillingInvoice> {
        self.mutate(
            invoice_id.as_str(),
            event_types::INVOICE_UPDATED,
            |invoice: &mut BillingInvoice, _| {
                if invoice.status == InvoiceStatus::Open {
                    invoice.next_attempt_at = Some(at);
                }
                Ok(())
            },
        )
    }

    /// Give up on collection: the invoice becomes uncollectible and the subscription unpaid.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription or invoice does not exist.
    pub fn fail_dunning(
        &self,
        subscription_id: &SubscriptionId,
        invoice_id: &InvoiceId,
    ) -> Result<Subscription> {
        let sub = self.store().transaction(|tx| {
            let mut invoice: BillingInvoice = tx.require(invoice_id.as_str())?;
            if invoice.status == InvoiceStatus::Open {
                let previous = snapshot(&invoice)?;
                invoice.mark_uncollectible()?;
                tx.update(&invoice)?;
                self.record(
                    tx,
                    event_types::INVOICE_MARKED_UNCOLLECTIBLE,
                    &invoice,
                    Some(previous),
                )?;
            }

            let mut sub: Subscription = tx.require(subscription_id.as_str())?;
            if !sub.status.is_terminal() {
                let previous = snapshot(&sub)?;
                sub.mark_unpaid(self.now());
                tx.update(&sub)?;
                self.record(tx, event_types::SUBSCRIPTION_UPDATED, &sub, Some(previous))?;
            }
            Ok::<_, BillingError>(sub)
        })?;
        self.wake_dispatcher();
        tracing::warn!(
            subscription_id = %subscription_id,
            invoice_id = %invoice_id,
            "Dunning exhausted, subscription unpaid"
        );
        Ok(sub)
    }

    /// Return a past-due subscription to active. Other statuses are left unchanged.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription does not exist.
    pub fn reactivate_subscription(&self, id: &SubscriptionId) -> Result<Subscription> {
        let sub = self.store().transaction(|tx| {
            let mut sub: Subscription = tx.require(id.as_str())?;
            if sub.status != SubscriptionStatus::PastDue {
                return Ok(sub);
            }
            let previous = snapshot(&sub)?;
            sub.reactivate(self.now());
            tx.update(&sub)?;
            self.record(tx, event_types::SUBSCRIPTION_UPDATED, &sub, Some(previous))?;
            Ok::<_, BillingError>(sub)
        })?;
        self.wake_dispatcher();
        tracing::info!(subscription_id = %id, status = %sub.status, "Subscription reactivated");
        Ok(sub)
    }

    fn swap_plan_in(
        &self,
        tx: &mut Tx<'_>,
        sub: &mut Subscription,
        plan: Plan,
        prorate: bool,
    ) -> Result<()> {
        if sub.status.is_terminal() {
            return Err(BillingError::invalid_state("subscription", sub.status, "change plan of"));
        }
        let previous = snapshot(&*sub)?;
        if let Some(line) = sub.change_plan(plan, prorate, self.now()) {
            if line.amount != 0 {
                tracing::debug!(
                    subscription_id = %sub.id,
                    amount = line.amount,
                    "Proration queued"
                );
                sub.pending_invoice_items.push(line);
            }
        }
        tx.update(&*sub)?;
        self.record(tx, event_types::SUBSCRIPTION_UPDATED, &*sub, Some(previous))
    }

    fn create_renewal_invoice(&self, id: &SubscriptionId) -> Result<BillingInvoice> {
        let invoice = self.store().transaction(|tx| {
            let mut sub: Subscription = tx.require(id.as_str())?;
            let now = self.now();
            let (start, end) = (sub.current_period_start, sub.current_period_end);
            let currency = self.currency_or_default(Some(sub.plan.currency.as_str()));

            let mut invoice = BillingInvoice::draft(sub.customer_id.clone(), currency, now)
                .for_subscription(sub.id.clone(), start, end);
            let plan_line = LineItem::new(
                LineItemKind::Subscription,
                format!("{} ({} to {})", sub.plan.name, start.date_naive(), end.date_naive()),
                sub.plan.amount,
            )
            .with_period(start, end);
            invoice.add_line_item(plan_line)?;
            for line in std::mem::take(&mut sub.pending_invoice_items) {
                invoice.add_line_item(line)?;
            }

            let items = tx.query::<SubscriptionItem>(|i| i.subscription_id == sub.id)?;
            let mut usages = Vec::with_capacity(items.len());
            for item in &items {
                let usage = self.item_usage_in(tx, item, &sub.customer_id, start, end)?;
                for line in &usage.line_items {
                    invoice.add_line_item(line.clone())?;
                }
                usages.push((item, usage));
            }

            let tax = self.tax_in(tx, sub.tax_address.as_ref(), invoice.subtotal)?;
            invoice.set_tax(tax.lines)?;
            invoice.finalize(now)?;
            tx.create(&invoice)?;
            for (item, usage) in &usages {
                self.stage_watermark(tx, item, &invoice.id, usage)?;
            }

            sub.latest_invoice_id = Some(invoice.id.clone());
            sub.updated_at = now;
            tx.update(&sub)?;
            self.record(tx, event_types::INVOICE_CREATED, &invoice, None)?;
            self.record(tx, event_types::INVOICE_FINALIZED, &invoice, None)?;
            Ok::<_, BillingError>(invoice)
        })?;
        tracing::info!(
            invoice_id = %invoice.id,
            subscription_id = %id,
            subtotal = invoice.subtotal,
            tax = invoice.tax,
            amount_due = invoice.amount_due,
            "Renewal invoice created"
        );
        Ok(invoice)
    }
}

fn release_schedules(tx: &mut Tx<'_>, id: &SubscriptionId, now: DateTime<Utc>) -> Result<()> {
    let queued = tx.query::<SubscriptionSchedule>(|s| {
        s.subscription_id == *id && s.status == ScheduleStatus::Active
    })?;
    for mut schedule in queued {
        schedule.release(now)?;
        tx.update(&schedule)?;
    }
    Ok(())
}
