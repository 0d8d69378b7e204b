//! Subscriptions, their metered items and scheduled plan changes.
//!
//! Creating a subscription only persists it. Its lifecycle (trial end, renewals, dunning)
//! is driven by the [`WorkflowRunner`](crate::workflow::WorkflowRunner), which calls the
//! idempotent activities in [`crate::workflow`].

use commerce_billing_core::{
    event_types, subscription, Address, BillingError, CustomerId, Meter, MeterId, Plan,
    PricingRule, PricingRuleId, Result, ScheduleId, ScheduleStatus, Subscription,
    SubscriptionId, SubscriptionItem, SubscriptionSchedule,
};
use commerce_billing_store::StoreExt;

use crate::engine::BillingEngine;

/// Parameters for a new subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    /// Subscribing customer.
    pub customer_id: CustomerId,
    /// Plan billed every period.
    pub plan: Plan,
    /// Metered items: a meter and an optional pinned pricing rule.
    pub items: Vec<(MeterId, Option<PricingRuleId>)>,
    /// Address used for tax on renewal invoices.
    pub tax_address: Option<Address>,
}

impl NewSubscription {
    /// A subscription to `plan` with no metered items.
    #[must_use]
    pub fn new(customer_id: impl Into<CustomerId>, plan: Plan) -> Self {
        Self {
            customer_id: customer_id.into(),
            plan,
            items: Vec::new(),
            tax_address: None,
        }
    }

    /// Bill usage of `meter_id`, priced by `pricing_rule_id` or the meter's first rule.
    #[must_use]
    pub fn with_item(
        mut self,
        meter_id: impl Into<MeterId>,
        pricing_rule_id: Option<PricingRuleId>,
    ) -> Self {
        self.items.push((meter_id.into(), pricing_rule_id));
        self
    }

    /// Tax renewal invoices for `address`.
    #[must_use]
    pub fn with_tax_address(mut self, address: Address) -> Self {
        self.tax_address = Some(address);
        self
    }
}

impl BillingEngine {
    /// Persist a new subscription and its items.
    ///
    /// With a trial the subscription starts `trialing` and its first period begins when
    /// the trial ends.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty customer id, a negative plan amount, or a pricing rule
    ///   that prices a different meter.
    /// - `NotFound` if a meter or pricing rule does not exist.
    pub fn start_subscription(&self, params: NewSubscription) -> Result<Subscription> {
        if params.customer_id.is_empty() {
            return Err(BillingError::validation("customer_id is required"));
        }
        if params.plan.amount < 0 {
            return Err(BillingError::validation("plan amount must not be negative"));
        }

        let now = self.now();
        let mut sub = subscription::start_subscription(params.customer_id, params.plan, now);
        sub.tax_address = params.tax_address;

        self.store().transaction(|tx| {
            for (meter_id, rule_id) in params.items {
                tx.require::<Meter>(meter_id.as_str())?;
                let mut item = SubscriptionItem::new(sub.id.clone(), meter_id, now);
                if let Some(rule_id) = rule_id {
                    let rule: PricingRule = tx.require(rule_id.as_str())?;
                    if rule.meter_id != item.meter_id {
                        return Err(BillingError::validation(format!(
                            "pricing rule {rule_id} does not price meter {}",
                            item.meter_id
                        )));
                    }
                    item = item.with_pricing_rule(rule_id);
                }
                tx.create(&item)?;
                sub.item_ids.push(item.id);
            }
            tx.create(&sub)?;
            self.record(tx, event_types::SUBSCRIPTION_CREATED, &sub, None)
        })?;
        self.wake_dispatcher();

        tracing::info!(
            subscription_id = %sub.id,
            customer_id = %sub.customer_id,
            plan = %sub.plan.id,
            status = %sub.status,
            items = sub.item_ids.len(),
            "Subscription created"
        );
        Ok(sub)
    }

    /// Get a subscription.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription does not exist.
    pub fn get_subscription(&self, id: &SubscriptionId) -> Result<Subscription> {
        Ok(self.store().require(id.as_str())?)
    }

    /// A customer's subscriptions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub fn list_subscriptions(&self, customer_id: &CustomerId) -> Result<Vec<Subscription>> {
        let mut subs = self
            .store()
            .query::<Subscription>(|s| s.customer_id == *customer_id)?;
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    /// The metered items of a subscription.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails.
    pub fn list_subscription_items(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<SubscriptionItem>> {
        Ok(self
            .store()
            .query::<SubscriptionItem>(|i| i.subscription_id == *subscription_id)?)
    }

    /// Queue a plan change applied at the next renewal, replacing any queued change.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the subscription does not exist.
    /// - `InvalidState` if the subscription has ended.
    pub fn schedule_plan_change(
        &self,
        subscription_id: &SubscriptionId,
        plan: Plan,
        prorate: bool,
    ) -> Result<SubscriptionSchedule> {
        let schedule = self.store().transaction(|tx| {
            let sub: Subscription = tx.require(subscription_id.as_str())?;
            if sub.status.is_terminal() {
                return Err(BillingError::invalid_state(
                    "subscription",
                    sub.status,
                    "schedule plan change for",
                ));
            }
            let now = self.now();
            let queued = tx.query::<SubscriptionSchedule>(|s| {
                s.subscription_id == sub.id && s.status == ScheduleStatus::Active
            })?;
            for mut previous in queued {
                previous.release(now)?;
                tx.update(&previous)?;
            }
            let schedule = SubscriptionSchedule::new(sub.id, plan, prorate, now);
            tx.create(&schedule)?;
            Ok(schedule)
        })?;
        tracing::info!(
            schedule_id = %schedule.id,
            subscription_id = %subscription_id,
            plan = %schedule.plan.id,
            "Plan change scheduled"
        );
        Ok(schedule)
    }

    /// Withdraw a queued plan change.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the schedule does not exist.
    /// - `InvalidState` unless the schedule is still active.
    pub fn release_subscription_schedule(&self, id: &ScheduleId) -> Result<SubscriptionSchedule> {
        let schedule = self.store().transaction(|tx| {
            let mut schedule: SubscriptionSchedule = tx.require(id.as_str())?;
            schedule.release(self.now())?;
            tx.update(&schedule)?;
            Ok::<_, BillingError>(schedule)
        })?;
        tracing::info!(schedule_id = %id, "Subscription schedule released");
        Ok(schedule)
    }
}
