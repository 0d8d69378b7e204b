//! Subscriptions, plans and proration.
//!
//! A subscription snapshots the plan it was started (or last changed) on, so later edits to
//! a catalogue never rewrite what a customer agreed to pay.

use std::fmt;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};
use crate::ids::{
    CustomerId, InvoiceId, MeterId, PlanId, PricingRuleId, ScheduleId, SubscriptionId,
    SubscriptionItemId,
};
use crate::invoice::{LineItem, LineItemKind};
use crate::tax::Address;

// =============================================================================
// Plans
// =============================================================================

/// Billing interval unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanInterval {
    /// Calendar month.
    Month,
    /// Calendar year.
    Year,
}

/// A recurring price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Plan identifier.
    pub id: PlanId,
    /// Display name.
    pub name: String,
    /// Price per interval in cents.
    pub amount: i64,
    /// Currency code.
    pub currency: String,
    /// Interval unit.
    pub interval: PlanInterval,
    /// Number of units per period; values below 1 count as 1.
    pub interval_count: u32,
    /// Free trial length in days.
    pub trial_days: u32,
}

impl Plan {
    /// A monthly plan without a trial.
    #[must_use]
    pub fn monthly(id: impl Into<PlanId>, name: impl Into<String>, amount: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            amount,
            currency: "usd".to_string(),
            interval: PlanInterval::Month,
            interval_count: 1,
            trial_days: 0,
        }
    }

    /// Set the trial length.
    #[must_use]
    pub fn with_trial_days(mut self, trial_days: u32) -> Self {
        self.trial_days = trial_days;
        self
    }

    /// Set the interval.
    #[must_use]
    pub fn with_interval(mut self, interval: PlanInterval, interval_count: u32) -> Self {
        self.interval = interval;
        self.interval_count = interval_count;
        self
    }
}

/// End of a period starting at `start`: `max(1, interval_count)` calendar months or years
/// later, clamping the day of month (Jan 31 + 1 month = Feb 28/29).
#[must_use]
pub fn advance_period(start: DateTime<Utc>, plan: &Plan) -> DateTime<Utc> {
    let count = plan.interval_count.max(1);
    let months = match plan.interval {
        PlanInterval::Month => count,
        PlanInterval::Year => count.saturating_mul(12),
    };
    start
        .checked_add_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// In a free trial.
    Trialing,
    /// Paid up.
    Active,
    /// Renewal payment failed; dunning in progress.
    PastDue,
    /// Ended by cancellation.
    Canceled,
    /// Ended after dunning gave up.
    Unpaid,
}

impl SubscriptionStatus {
    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
        }
    }

    /// Whether the subscription has ended.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Unpaid)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metered component of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    /// Item identifier.
    pub id: SubscriptionItemId,
    /// Owning subscription.
    pub subscription_id: SubscriptionId,
    /// Meter whose usage is billed.
    pub meter_id: MeterId,
    /// Pinned pricing rule; the meter's first rule is used when absent.
    pub pricing_rule_id: Option<PricingRuleId>,
    /// Seat quantity.
    pub quantity: i64,
    /// When the item was added.
    pub created_at: DateTime<Utc>,
}

impl SubscriptionItem {
    /// Create an item for a meter.
    #[must_use]
    pub fn new(subscription_id: SubscriptionId, meter_id: MeterId, now: DateTime<Utc>) -> Self {
        Self {
            id: SubscriptionItemId::generate(),
            subscription_id,
            meter_id,
            pricing_rule_id: None,
            quantity: 1,
            created_at: now,
        }
    }

    /// Pin a pricing rule.
    #[must_use]
    pub fn with_pricing_rule(mut self, rule: PricingRuleId) -> Self {
        self.pricing_rule_id = Some(rule);
        self
    }
}

/// A customer's recurring agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscription identifier.
    pub id: SubscriptionId,
    /// The subscribed customer.
    pub customer_id: CustomerId,
    /// Snapshot of the current plan.
    pub plan: Plan,
    /// Metered items.
    #[serde(default)]
    pub item_ids: Vec<SubscriptionItemId>,
    /// Current status.
    pub status: SubscriptionStatus,
    /// Start of the current period.
    pub current_period_start: DateTime<Utc>,
    /// End of the current period.
    pub current_period_end: DateTime<Utc>,
    /// Trial start.
    pub trial_start: Option<DateTime<Utc>>,
    /// Trial end.
    pub trial_end: Option<DateTime<Utc>>,
    /// Cancel when the current period ends.
    pub cancel_at_period_end: bool,
    /// When cancellation took effect or was requested.
    pub canceled_at: Option<DateTime<Utc>>,
    /// When the subscription ended.
    pub ended_at: Option<DateTime<Utc>>,
    /// Proration lines to bill on the next renewal invoice.
    #[serde(default)]
    pub pending_invoice_items: Vec<LineItem>,
    /// Most recent renewal invoice.
    pub latest_invoice_id: Option<InvoiceId>,
    /// Address used for tax on renewal invoices.
    pub tax_address: Option<Address>,
    /// When the subscription was created.
    pub created_at: DateTime<Utc>,
    /// When the subscription last changed.
    pub updated_at: DateTime<Utc>,
}

/// Start a subscription on `plan` at `now`.
///
/// With a trial the first paid period starts when the trial ends.
#[must_use]
pub fn start_subscription(customer_id: CustomerId, plan: Plan, now: DateTime<Utc>) -> Subscription {
    let (status, trial_start, trial_end, period_start) = if plan.trial_days > 0 {
        let trial_end = now + Duration::days(i64::from(plan.trial_days));
        (SubscriptionStatus::Trialing, Some(now), Some(trial_end), trial_end)
    } else {
        (SubscriptionStatus::Active, None, None, now)
    };
    let period_end = advance_period(period_start, &plan);

    Subscription {
        id: SubscriptionId::generate(),
        customer_id,
        plan,
        item_ids: Vec::new(),
        status,
        current_period_start: period_start,
        current_period_end: period_end,
        trial_start,
        trial_end,
        cancel_at_period_end: false,
        canceled_at: None,
        ended_at: None,
        pending_invoice_items: Vec::new(),
        latest_invoice_id: None,
        tax_address: None,
        created_at: now,
        updated_at: now,
    }
}

impl Subscription {
    /// End the trial and start paying.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the subscription is trialing.
    pub fn end_trial(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != SubscriptionStatus::Trialing {
            return Err(BillingError::invalid_state("subscription", self.status, "end trial of"));
        }
        self.status = SubscriptionStatus::Active;
        self.updated_at = now;
        Ok(())
    }

    /// Swap the plan, returning the proration line when `prorate` is set.
    ///
    /// The unused share of the current period is credited at the old price and charged at
    /// the new one: `amount = new * remaining/total - old * remaining/total`, by whole days.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn change_plan(
        &mut self,
        new_plan: Plan,
        prorate: bool,
        now: DateTime<Utc>,
    ) -> Option<LineItem> {
        let old_plan = std::mem::replace(&mut self.plan, new_plan);
        self.updated_at = now;
        if !prorate {
            return None;
        }

        let total_days = (self.current_period_end - self.current_period_start).num_days();
        if total_days <= 0 {
            return None;
        }
        let remaining_days = (self.current_period_end - now).num_days().clamp(0, total_days);
        let fraction = remaining_days as f64 / total_days as f64;

        let old_credit = (old_plan.amount as f64 * fraction).round() as i64;
        let new_charge = (self.plan.amount as f64 * fraction).round() as i64;
        let description = format!(
            "Proration: {} to {} ({remaining_days}/{total_days} days)",
            old_plan.name, self.plan.name
        );
        Some(
            LineItem::new(LineItemKind::Proration, description, new_charge - old_credit)
                .with_period(now, self.current_period_end),
        )
    }

    /// Cancel now or at the end of the current period.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the subscription already ended.
    pub fn cancel(&mut self, at_period_end: bool, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(BillingError::invalid_state("subscription", self.status, "cancel"));
        }
        if at_period_end {
            self.cancel_at_period_end = true;
        } else {
            self.status = SubscriptionStatus::Canceled;
            self.canceled_at = Some(now);
            self.ended_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    /// Move to the next period after a renewal invoice, active if it was paid.
    pub fn advance(&mut self, paid: bool, now: DateTime<Utc>) {
        self.current_period_start = self.current_period_end;
        self.current_period_end = advance_period(self.current_period_start, &self.plan);
        self.status = if paid {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::PastDue
        };
        self.updated_at = now;
    }

    /// Give up on collection.
    pub fn mark_unpaid(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Unpaid;
        self.ended_at = Some(now);
        self.updated_at = now;
    }

    /// Reactivate a past-due subscription whose invoice was settled.
    pub fn reactivate(&mut self, now: DateTime<Utc>) {
        if self.status == SubscriptionStatus::PastDue {
            self.status = SubscriptionStatus::Active;
            self.updated_at = now;
        }
    }
}

// =============================================================================
// Schedules
// =============================================================================

/// Schedule status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Waiting for the next renewal.
    Active,
    /// Withdrawn before it applied.
    Released,
    /// Applied.
    Completed,
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Released => "released",
            Self::Completed => "completed",
        })
    }
}

/// A plan change queued for the next renewal boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSchedule {
    /// Schedule identifier.
    pub id: ScheduleId,
    /// The subscription to change.
    pub subscription_id: SubscriptionId,
    /// Plan to swap in.
    pub plan: Plan,
    /// Prorate the swap.
    pub prorate: bool,
    /// Current status.
    pub status: ScheduleStatus,
    /// When the schedule was created.
    pub created_at: DateTime<Utc>,
    /// When the schedule applied or was released.
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubscriptionSchedule {
    /// Queue a plan change.
    #[must_use]
    pub fn new(
        subscription_id: SubscriptionId,
        plan: Plan,
        prorate: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ScheduleId::generate(),
            subscription_id,
            plan,
            prorate,
            status: ScheduleStatus::Active,
            created_at: now,
            completed_at: None,
        }
    }

    /// Mark the schedule applied.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = ScheduleStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Withdraw the schedule.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the schedule is active.
    pub fn release(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != ScheduleStatus::Active {
            return Err(BillingError::invalid_state(
                "subscription schedule",
                self.status,
                "release",
            ));
        }
        self.status = ScheduleStatus::Released;
        self.completed_at = Some(now);
        Ok(())
    }
}
