//! Subscription management
//!
//! Lifecycle: `trialing | active → past_due → active | canceled`,
//! `active ⇄ paused`, and `canceled` is absorbing. Every write goes through
//! `BillingStore::update_subscription`, which checks the row version, so two
//! processes acting on the same subscription cannot both succeed.
//!
//! Renewal claims the subscription (version bump pointing `latest_payment_id`
//! at a fresh pending payment) *before* charging, so concurrent renewal runs
//! charge the gateway at most once.

use std::sync::Arc;

use inkwell_shared::{BillingCycle, Plan, PlanCatalog};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::alerting::AlertSink;
use crate::config::BillingPolicy;
use crate::crypto::BillingKeyCipher;
use crate::email::{BillingEmails, Mailer};
use crate::error::{BillingError, BillingResult, PaymentErrorKind};
use crate::gateway::{ChargeRequest, GatewayPayment, GatewayPaymentStatus, PaymentGateway};
use crate::ledger::CreditLedger;
use crate::models::{
    BillingKey, CreditTransactionType, NewCreditTransaction, Payment, PaymentMetadata,
    PaymentStatus, Subscription, SubscriptionStatus,
};
use crate::order_id::{self, OrderPrefix};
use crate::payments::{PaymentSettler, Settlement};
use crate::proration::{calculate_proration, ChangeType, ProrationResult};
use crate::retry::with_persistence_retry;
use crate::store::BillingStore;

/// Start of a recurring subscription from a checkout authorization
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: String,
    pub cycle: BillingCycle,
    /// One-time authorization key from the gateway's card widget
    pub auth_key: String,
    pub customer_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanChangeOutcome {
    pub proration: ProrationResult,
    pub subscription: Subscription,
    pub payment: Option<Payment>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RenewalOutcome {
    Renewed { subscription: Subscription },
    PastDue { subscription: Subscription },
    Canceled { subscription: Subscription },
    /// Charge outcome unknown; reconciled on the next run
    Unresolved { payment_id: Uuid },
    Skipped { reason: &'static str },
}

pub(crate) fn grant_key(payment_id: Uuid) -> String {
    format!("grant:{}", payment_id)
}

/// Credits included with one period of `plan` on `cycle`
pub fn period_credits(plan: &Plan, cycle: BillingCycle) -> i64 {
    plan.monthly_credits * (cycle.days() / 30)
}

fn ensure_transition(sub: &Subscription, to: SubscriptionStatus) -> BillingResult<()> {
    if sub.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(BillingError::InvalidTransition {
            from: sub.status.to_string(),
            to: to.to_string(),
        })
    }
}

/// Subscription state machine
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    ledger: CreditLedger,
    settler: PaymentSettler,
    cipher: BillingKeyCipher,
    mailer: Arc<dyn Mailer>,
    alerts: Arc<dyn AlertSink>,
    policy: BillingPolicy,
}

impl SubscriptionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        ledger: CreditLedger,
        settler: PaymentSettler,
        cipher: BillingKeyCipher,
        mailer: Arc<dyn Mailer>,
        alerts: Arc<dyn AlertSink>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            ledger,
            settler,
            cipher,
            mailer,
            alerts,
            policy,
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub async fn current(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.store.live_subscription(user_id).await
    }

    async fn live_for(&self, user_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .live_subscription(user_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)
    }

    fn plan(&self, plan_id: &str) -> BillingResult<Plan> {
        self.catalog
            .plan(plan_id)
            .cloned()
            .ok_or_else(|| BillingError::InvalidPlan(plan_id.to_string()))
    }

    fn paid_plan(&self, plan_id: &str) -> BillingResult<Plan> {
        let plan = self.plan(plan_id)?;
        if plan.is_free() {
            return Err(BillingError::InvalidPlan(format!(
                "{} is not a paid plan",
                plan_id
            )));
        }
        Ok(plan)
    }

    async fn billing_key_for(&self, sub: &Subscription) -> BillingResult<BillingKey> {
        let key = match sub.billing_key_id {
            Some(id) => self.store.get_billing_key(id).await?,
            None => self.store.default_billing_key(sub.user_id).await?,
        };
        key.ok_or(BillingError::BillingKeyRequired)
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Issue a billing key, charge the first period and activate
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        request: SubscribeRequest,
    ) -> BillingResult<Subscription> {
        let plan = self.paid_plan(&request.plan_id)?;
        if self.store.live_subscription(user_id).await?.is_some() {
            return Err(BillingError::SubscriptionAlreadyActive);
        }

        let now = OffsetDateTime::now_utc();
        let issued = self
            .gateway
            .issue_billing_key(&request.auth_key, &request.customer_key)
            .await?;
        let key = BillingKey {
            id: Uuid::new_v4(),
            user_id,
            customer_key: issued.customer_key,
            encrypted_key: self.cipher.encrypt(&issued.billing_key)?,
            card_company: issued.card_company,
            card_number_masked: issued.card.and_then(|c| c.number),
            is_default: true,
            created_at: now,
        };
        self.store.insert_billing_key(&key).await?;

        let payment = Payment::new_pending(
            user_id,
            order_id::generate(OrderPrefix::Subscription, now),
            plan.price(request.cycle),
            PaymentMetadata::Subscription {
                plan_id: plan.id.clone(),
                cycle: request.cycle,
                billing_key_id: key.id,
            },
            now,
        );
        self.store.insert_payment(&payment).await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan.id,
            cycle = %request.cycle,
            order_id = %payment.order_id,
            "Starting subscription"
        );

        let confirmed = self.charge(&key, &payment).await?;
        match self.settler.settle(&payment, &confirmed).await? {
            Settlement::Completed(paid) | Settlement::AlreadyCompleted(paid) => {
                self.activate_from_payment(&paid).await
            }
            Settlement::Conflict(current) => Err(BillingError::InvalidPaymentTransition {
                from: current.status.to_string(),
                to: PaymentStatus::Completed.to_string(),
            }),
        }
    }

    /// Charge a stored billing key for a pending payment.
    /// Definitive failures close the payment; unknown outcomes leave it pending.
    async fn charge(&self, key: &BillingKey, payment: &Payment) -> BillingResult<GatewayPayment> {
        let billing_key = self.cipher.decrypt(&key.encrypted_key)?;
        let request = ChargeRequest {
            customer_key: key.customer_key.clone(),
            amount: payment.amount,
            order_id: payment.order_id.clone(),
            order_name: payment.metadata.order_name(),
        };

        match self.gateway.charge_billing_key(&billing_key, &request).await {
            Ok(confirmed) => Ok(confirmed),
            Err(e) if e.kind == PaymentErrorKind::Unknown => {
                tracing::warn!(
                    order_id = %payment.order_id,
                    code = %e.code,
                    "Charge outcome unknown, payment left pending"
                );
                Err(e.into())
            }
            Err(e) => {
                self.settler.fail(payment, &e.code, &e.message).await?;
                Err(e.into())
            }
        }
    }

    /// Create the subscription a completed plan payment paid for.
    /// Idempotent per payment.
    pub async fn activate_from_payment(&self, payment: &Payment) -> BillingResult<Subscription> {
        let (plan_id, cycle, billing_key_id) = match &payment.metadata {
            PaymentMetadata::PlanPass { plan_id, cycle } => (plan_id, *cycle, None),
            PaymentMetadata::Subscription {
                plan_id,
                cycle,
                billing_key_id,
            } => (plan_id, *cycle, Some(*billing_key_id)),
            other => {
                return Err(BillingError::InvalidInput(format!(
                    "Payment {} does not start a subscription ({:?})",
                    payment.id, other
                )))
            }
        };
        let plan = self.plan(plan_id)?;

        if let Some(existing) = self.store.subscription_for_payment(payment.id).await? {
            // a run cut short after the insert still owes the entitlement
            if existing.status.is_live()
                && existing.plan_id == plan.id
                && existing.latest_payment_id == Some(payment.id)
            {
                self.ensure_entitled(payment.user_id, &plan).await?;
                self.grant_period_credits(payment, &plan, cycle, existing.current_period_end)
                    .await?;
            }
            return Ok(existing);
        }

        let now = OffsetDateTime::now_utc();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: payment.user_id,
            plan_id: plan.id.clone(),
            billing_cycle: cycle,
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: now + Duration::days(cycle.days()),
            cancel_at_period_end: billing_key_id.is_none(),
            canceled_at: None,
            retry_count: 0,
            next_retry_at: None,
            scheduled_plan_id: None,
            scheduled_cycle: None,
            billing_key_id,
            latest_payment_id: Some(payment.id),
            version: 0,
            created_at: now,
            updated_at: now,
        };

        let store = &self.store;
        let candidate = &subscription;
        let payment_id = payment.id;
        let activated = with_persistence_retry(
            &self.policy,
            self.alerts.as_ref(),
            "activate_subscription",
            serde_json::json!({
                "payment_id": payment.id,
                "user_id": payment.user_id,
                "plan_id": plan.id,
                "amount": payment.amount,
            }),
            move || async move {
                match store.insert_subscription(candidate).await {
                    Ok(()) => Ok(candidate.clone()),
                    Err(BillingError::SubscriptionAlreadyActive) => store
                        .subscription_for_payment(payment_id)
                        .await?
                        .ok_or(BillingError::SubscriptionAlreadyActive),
                    Err(e) => Err(e),
                }
            },
        )
        .await?;

        if activated.id == subscription.id {
            self.entitle(payment.user_id, &plan, true).await?;
            self.grant_period_credits(payment, &plan, cycle, activated.current_period_end)
                .await?;
            tracing::info!(
                user_id = %payment.user_id,
                subscription_id = %activated.id,
                plan_id = %plan.id,
                period_end = %activated.current_period_end,
                recurring = activated.is_recurring(),
                "Subscription activated"
            );
        }
        Ok(activated)
    }

    /// Point the profile at `plan`, optionally resetting today's quota to the plan's
    async fn entitle(&self, user_id: Uuid, plan: &Plan, reset_quota: bool) -> BillingResult<()> {
        let store = &self.store;
        let plan_id = plan.id.as_str();
        let quota = reset_quota.then_some(plan.daily_generations);
        with_persistence_retry(
            &self.policy,
            self.alerts.as_ref(),
            "update_profile_plan",
            serde_json::json!({ "user_id": user_id, "plan_id": plan_id }),
            move || async move { store.set_profile_plan(user_id, plan_id, quota).await },
        )
        .await
    }

    /// Entitle `plan` unless the profile already points at it
    async fn ensure_entitled(&self, user_id: Uuid, plan: &Plan) -> BillingResult<()> {
        let current = self.store.get_profile(user_id).await?.map(|p| p.plan_id);
        if current.as_deref() == Some(plan.id.as_str()) {
            return Ok(());
        }
        self.entitle(user_id, plan, true).await
    }

    async fn downgrade_to_free(&self, user_id: Uuid) -> BillingResult<()> {
        let free = self.catalog.free_plan();
        self.entitle(user_id, &free, true).await
    }

    async fn grant_credits(
        &self,
        payment: &Payment,
        amount: i64,
        description: String,
        expires_at: OffsetDateTime,
    ) -> BillingResult<()> {
        if amount <= 0 {
            return Ok(());
        }
        let entry = NewCreditTransaction {
            user_id: payment.user_id,
            tx_type: CreditTransactionType::SubscriptionGrant,
            amount,
            description,
            payment_id: Some(payment.id),
            expires_at: Some(expires_at),
            idempotency_key: Some(grant_key(payment.id)),
        };
        let entry = &entry;
        let ledger = &self.ledger;
        with_persistence_retry(
            &self.policy,
            self.alerts.as_ref(),
            "grant_subscription_credits",
            serde_json::json!({
                "payment_id": payment.id,
                "user_id": payment.user_id,
                "amount": amount,
            }),
            move || async move { ledger.apply_transaction(entry.clone()).await },
        )
        .await?;
        Ok(())
    }

    async fn grant_period_credits(
        &self,
        payment: &Payment,
        plan: &Plan,
        cycle: BillingCycle,
        expires_at: OffsetDateTime,
    ) -> BillingResult<()> {
        self.grant_credits(
            payment,
            period_credits(plan, cycle),
            format!("{} plan credits ({})", plan.name, cycle),
            expires_at,
        )
        .await
    }

    // =========================================================================
    // Plan changes
    // =========================================================================

    pub async fn preview_change(
        &self,
        user_id: Uuid,
        plan_id: &str,
        cycle: BillingCycle,
    ) -> BillingResult<ProrationResult> {
        let sub = self.live_for(user_id).await?;
        self.prorate(&sub, plan_id, cycle)
    }

    fn prorate(
        &self,
        sub: &Subscription,
        plan_id: &str,
        cycle: BillingCycle,
    ) -> BillingResult<ProrationResult> {
        let current = self.plan(&sub.plan_id)?;
        let target = self.paid_plan(plan_id)?;
        Ok(calculate_proration(
            &current,
            sub.billing_cycle,
            &target,
            cycle,
            sub.current_period_end,
            OffsetDateTime::now_utc(),
            self.policy.minimum_charge_amount,
        ))
    }

    /// Upgrade now (charging the prorated difference) or schedule a downgrade
    pub async fn change_plan(
        &self,
        user_id: Uuid,
        plan_id: &str,
        cycle: BillingCycle,
    ) -> BillingResult<PlanChangeOutcome> {
        let mut sub = self.live_for(user_id).await?;
        if sub.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidTransition {
                from: sub.status.to_string(),
                to: format!("{} ({})", plan_id, cycle),
            });
        }
        if !sub.is_recurring() {
            return Err(BillingError::BillingKeyRequired);
        }

        let proration = self.prorate(&sub, plan_id, cycle)?;

        if proration.change_type == ChangeType::Same {
            if sub.scheduled_plan_id.is_some() || sub.scheduled_cycle.is_some() {
                sub.scheduled_plan_id = None;
                sub.scheduled_cycle = None;
                sub = self.store.update_subscription(&sub).await?;
                tracing::info!(user_id = %user_id, "Scheduled plan change withdrawn");
            }
            return Ok(PlanChangeOutcome {
                proration,
                subscription: sub,
                payment: None,
            });
        }

        if !proration.immediate {
            sub.scheduled_plan_id = Some(plan_id.to_string());
            sub.scheduled_cycle = Some(cycle);
            let sub = self.store.update_subscription(&sub).await?;
            tracing::info!(
                user_id = %user_id,
                from = %sub.plan_id,
                to = %plan_id,
                effective = %proration.effective_date,
                "Plan change scheduled for period end"
            );
            let (from, to) = (self.plan(&sub.plan_id)?, self.plan(plan_id)?);
            self.notify(
                user_id,
                BillingEmails::plan_changed(&from, &to, proration.effective_date),
            )
            .await;
            return Ok(PlanChangeOutcome {
                proration,
                subscription: sub,
                payment: None,
            });
        }

        let (from_plan_id, from_cycle) = (sub.plan_id.clone(), sub.billing_cycle);

        if !proration.requires_payment {
            let (subscription, _) = self
                .switch_plan(sub.id, &from_plan_id, from_cycle, plan_id, cycle)
                .await?;
            self.entitle(user_id, &self.plan(plan_id)?, true).await?;
            return Ok(PlanChangeOutcome {
                proration,
                subscription,
                payment: None,
            });
        }

        let key = self.billing_key_for(&sub).await?;
        let now = OffsetDateTime::now_utc();
        let payment = Payment::new_pending(
            user_id,
            order_id::generate(OrderPrefix::Change, now),
            proration.prorated_amount,
            PaymentMetadata::PlanChange {
                subscription_id: sub.id,
                from_plan_id,
                from_cycle,
                to_plan_id: plan_id.to_string(),
                to_cycle: cycle,
            },
            now,
        );
        self.store.insert_payment(&payment).await?;

        let confirmed = self.charge(&key, &payment).await?;
        let paid = match self.settler.settle(&payment, &confirmed).await? {
            Settlement::Completed(paid) | Settlement::AlreadyCompleted(paid) => paid,
            Settlement::Conflict(current) => {
                return Err(BillingError::InvalidPaymentTransition {
                    from: current.status.to_string(),
                    to: PaymentStatus::Completed.to_string(),
                })
            }
        };
        let subscription = self.apply_plan_change_payment(&paid).await?;

        Ok(PlanChangeOutcome {
            proration,
            subscription,
            payment: Some(paid),
        })
    }

    /// Apply a paid immediate plan change. Idempotent per payment.
    pub async fn apply_plan_change_payment(
        &self,
        payment: &Payment,
    ) -> BillingResult<Subscription> {
        let PaymentMetadata::PlanChange {
            subscription_id,
            from_plan_id,
            from_cycle,
            to_plan_id,
            to_cycle,
        } = &payment.metadata
        else {
            return Err(BillingError::InvalidInput(format!(
                "Payment {} is not a plan change",
                payment.id
            )));
        };

        let (sub, switched) = self
            .switch_plan(*subscription_id, from_plan_id, *from_cycle, to_plan_id, *to_cycle)
            .await?;

        // not switched but already on the target: an earlier run may have
        // stopped before entitling
        let finish = switched
            || (sub.status.is_live()
                && sub.plan_id == *to_plan_id
                && sub.billing_cycle == *to_cycle);
        if finish {
            let (from, to) = (self.plan(from_plan_id)?, self.plan(to_plan_id)?);
            if switched {
                self.entitle(payment.user_id, &to, true).await?;
            } else {
                self.ensure_entitled(payment.user_id, &to).await?;
            }
            let extra =
                period_credits(&to, *to_cycle) - period_credits(&from, *from_cycle);
            self.grant_credits(
                payment,
                extra,
                format!("{} plan upgrade credits", to.name),
                sub.current_period_end,
            )
            .await?;
        }
        Ok(sub)
    }

    /// Move the subscription from one plan/cycle to another if it is still on
    /// the former. A cycle change restarts the period.
    async fn switch_plan(
        &self,
        subscription_id: Uuid,
        from_plan_id: &str,
        from_cycle: BillingCycle,
        to_plan_id: &str,
        to_cycle: BillingCycle,
    ) -> BillingResult<(Subscription, bool)> {
        let store = &self.store;
        let outcome = with_persistence_retry(
            &self.policy,
            self.alerts.as_ref(),
            "switch_plan",
            serde_json::json!({
                "subscription_id": subscription_id,
                "from_plan_id": from_plan_id,
                "to_plan_id": to_plan_id,
            }),
            move || async move {
                let mut sub = store
                    .get_subscription(subscription_id)
                    .await?
                    .ok_or(BillingError::SubscriptionNotFound)?;
                if sub.plan_id != from_plan_id || sub.billing_cycle != from_cycle {
                    return Ok((sub, false));
                }

                let now = OffsetDateTime::now_utc();
                if from_plan_id == to_plan_id {
                    sub.current_period_start = now;
                    sub.current_period_end = now + Duration::days(to_cycle.days());
                }
                sub.plan_id = to_plan_id.to_string();
                sub.billing_cycle = to_cycle;
                sub.scheduled_plan_id = None;
                sub.scheduled_cycle = None;
                Ok((store.update_subscription(&sub).await?, true))
            },
        )
        .await?;

        if outcome.1 {
            tracing::info!(
                subscription_id = %subscription_id,
                from = %from_plan_id,
                to = %to_plan_id,
                cycle = %to_cycle,
                "Plan switched"
            );
        }
        Ok(outcome)
    }

    // =========================================================================
    // Cancellation, resume, pause
    // =========================================================================

    /// Stop renewing; the subscription ends at `current_period_end`
    pub async fn cancel_at_period_end(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let mut sub = self.live_for(user_id).await?;
        if sub.cancel_at_period_end {
            return Ok(sub);
        }
        sub.cancel_at_period_end = true;
        let sub = self.store.update_subscription(&sub).await?;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            period_end = %sub.current_period_end,
            "Subscription set to cancel at period end"
        );
        Ok(sub)
    }

    /// Undo `cancel_at_period_end`
    pub async fn resume(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let mut sub = self.live_for(user_id).await?;
        if !sub.cancel_at_period_end {
            return Ok(sub);
        }
        if !sub.is_recurring() {
            return Err(BillingError::BillingKeyRequired);
        }
        sub.cancel_at_period_end = false;
        let sub = self.store.update_subscription(&sub).await?;
        tracing::info!(user_id = %user_id, subscription_id = %sub.id, "Subscription resumed");
        Ok(sub)
    }

    /// End the subscription now, without refund
    pub async fn cancel_immediately(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
    ) -> BillingResult<Subscription> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .filter(|s| s.user_id == user_id)
            .ok_or(BillingError::SubscriptionNotFound)?;
        if sub.status == SubscriptionStatus::Canceled {
            return Err(BillingError::SubscriptionAlreadyCanceled);
        }

        let canceled = self.finalize_cancel(sub, OffsetDateTime::now_utc()).await?;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            "Subscription canceled immediately"
        );
        Ok(canceled)
    }

    async fn finalize_cancel(
        &self,
        mut sub: Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        ensure_transition(&sub, SubscriptionStatus::Canceled)?;
        let plan = self.plan(&sub.plan_id)?;
        sub.status = SubscriptionStatus::Canceled;
        sub.canceled_at = Some(now);
        sub.next_retry_at = None;
        let sub = self.store.update_subscription(&sub).await?;

        self.downgrade_to_free(sub.user_id).await?;
        self.notify(sub.user_id, BillingEmails::subscription_canceled(&plan))
            .await;
        Ok(sub)
    }

    pub async fn pause(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let mut sub = self.live_for(user_id).await?;
        if sub.status != SubscriptionStatus::Active {
            return Err(BillingError::InvalidTransition {
                from: sub.status.to_string(),
                to: SubscriptionStatus::Paused.to_string(),
            });
        }
        sub.status = SubscriptionStatus::Paused;
        let sub = self.store.update_subscription(&sub).await?;
        tracing::info!(user_id = %user_id, subscription_id = %sub.id, "Subscription paused");
        Ok(sub)
    }

    pub async fn unpause(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let mut sub = self.live_for(user_id).await?;
        if sub.status != SubscriptionStatus::Paused {
            return Err(BillingError::InvalidTransition {
                from: sub.status.to_string(),
                to: SubscriptionStatus::Active.to_string(),
            });
        }
        sub.status = SubscriptionStatus::Active;
        let sub = self.store.update_subscription(&sub).await?;
        tracing::info!(user_id = %user_id, subscription_id = %sub.id, "Subscription unpaused");
        Ok(sub)
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    /// Renew, retry, or finalize one subscription as of `now`
    pub async fn process_renewal(
        &self,
        subscription_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<RenewalOutcome> {
        let sub = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound)?;

        let due = match sub.status {
            SubscriptionStatus::Active => {
                sub.current_period_end <= now + self.policy.renewal_lookahead
            }
            SubscriptionStatus::PastDue => sub.next_retry_at.is_some_and(|at| at <= now),
            _ => return Ok(RenewalOutcome::Skipped { reason: "not_renewable" }),
        };
        if !due {
            return Ok(RenewalOutcome::Skipped { reason: "not_due" });
        }

        if sub.cancel_at_period_end || !sub.is_recurring() {
            if sub.current_period_end > now {
                return Ok(RenewalOutcome::Skipped {
                    reason: "awaiting_period_end",
                });
            }
            return match self.finalize_cancel(sub, now).await {
                Ok(subscription) => {
                    tracing::info!(
                        subscription_id = %subscription.id,
                        user_id = %subscription.user_id,
                        "Subscription ended at period end"
                    );
                    Ok(RenewalOutcome::Canceled { subscription })
                }
                Err(BillingError::ConcurrentModification(_)) => Ok(RenewalOutcome::Skipped {
                    reason: "claimed_elsewhere",
                }),
                Err(e) => Err(e),
            };
        }

        if let Some(outcome) = self.reconcile_pending_renewal(&sub, now).await? {
            return Ok(outcome);
        }

        let plan_id = sub.scheduled_plan_id.clone().unwrap_or_else(|| sub.plan_id.clone());
        let cycle = sub.scheduled_cycle.unwrap_or(sub.billing_cycle);
        let plan = self.paid_plan(&plan_id)?;

        let payment = Payment::new_pending(
            sub.user_id,
            order_id::generate(OrderPrefix::Subscription, now),
            plan.price(cycle),
            PaymentMetadata::Renewal {
                subscription_id: sub.id,
                plan_id: plan.id.clone(),
                cycle,
                renews_period_end: sub.current_period_end,
            },
            now,
        );
        self.store.insert_payment(&payment).await?;

        // Claim before charging: only one runner gets past this update
        let mut claim = sub.clone();
        claim.latest_payment_id = Some(payment.id);
        let claimed = match self.store.update_subscription(&claim).await {
            Ok(claimed) => claimed,
            Err(BillingError::ConcurrentModification(_)) => {
                self.settler
                    .cancel_pending(&payment, "Renewal claimed by another run")
                    .await?;
                tracing::info!(
                    subscription_id = %sub.id,
                    "Renewal already claimed by another run"
                );
                return Ok(RenewalOutcome::Skipped {
                    reason: "claimed_elsewhere",
                });
            }
            Err(e) => return Err(e),
        };

        let key = match self.billing_key_for(&claimed).await {
            Ok(key) => key,
            Err(BillingError::BillingKeyRequired) => {
                let reason = "No billing key on file";
                self.settler
                    .fail(&payment, "BILLING_KEY_MISSING", reason)
                    .await?;
                return self.record_renewal_failure(claimed, reason, now).await;
            }
            Err(e) => return Err(e),
        };

        match self.charge(&key, &payment).await {
            Ok(confirmed) => match self.settler.settle(&payment, &confirmed).await {
                Ok(Settlement::Completed(paid)) | Ok(Settlement::AlreadyCompleted(paid)) => {
                    let subscription = self.apply_renewal_payment(&paid).await?;
                    Ok(RenewalOutcome::Renewed { subscription })
                }
                Ok(Settlement::Conflict(_)) => Ok(RenewalOutcome::Skipped {
                    reason: "payment_conflict",
                }),
                Err(BillingError::AmountMismatch { .. }) => {
                    self.record_renewal_failure(claimed, "Payment verification failed", now)
                        .await
                }
                Err(e) => Err(e),
            },
            Err(BillingError::Gateway(e)) if e.kind == PaymentErrorKind::Unknown => {
                Ok(RenewalOutcome::Unresolved {
                    payment_id: payment.id,
                })
            }
            Err(BillingError::Gateway(e)) => {
                self.record_renewal_failure(claimed, e.user_message(), now)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve a renewal payment left pending by an unknown charge outcome.
    /// Returns an outcome only when the earlier charge turned out to be paid.
    async fn reconcile_pending_renewal(
        &self,
        sub: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<Option<RenewalOutcome>> {
        let Some(payment_id) = sub.latest_payment_id else {
            return Ok(None);
        };
        let Some(previous) = self.store.get_payment(payment_id).await? else {
            return Ok(None);
        };
        if previous.status != PaymentStatus::Pending
            || !matches!(previous.metadata, PaymentMetadata::Renewal { .. })
        {
            return Ok(None);
        }
        // the charge may still be in flight on the runner that claimed it
        if previous.created_at + self.policy.renewal_settle_grace > now {
            return Ok(Some(RenewalOutcome::Skipped {
                reason: "renewal_in_progress",
            }));
        }

        match self
            .gateway
            .find_payment_by_order_id(&previous.order_id)
            .await?
        {
            Some(found) if found.status == GatewayPaymentStatus::Done => {
                tracing::info!(
                    order_id = %previous.order_id,
                    "Earlier renewal charge found paid at gateway"
                );
                match self.settler.settle(&previous, &found).await? {
                    Settlement::Completed(paid) | Settlement::AlreadyCompleted(paid) => {
                        let subscription = self.apply_renewal_payment(&paid).await?;
                        Ok(Some(RenewalOutcome::Renewed { subscription }))
                    }
                    Settlement::Conflict(_) => Ok(None),
                }
            }
            _ => {
                self.settler
                    .fail(
                        &previous,
                        "NOT_CHARGED",
                        "Renewal charge not found at gateway",
                    )
                    .await?;
                Ok(None)
            }
        }
    }

    /// Advance the period a renewal payment paid for. Idempotent per payment.
    pub async fn apply_renewal_payment(&self, payment: &Payment) -> BillingResult<Subscription> {
        let PaymentMetadata::Renewal {
            subscription_id,
            plan_id,
            cycle,
            renews_period_end,
        } = &payment.metadata
        else {
            return Err(BillingError::InvalidInput(format!(
                "Payment {} is not a renewal",
                payment.id
            )));
        };
        let (subscription_id, cycle, renews_period_end) =
            (*subscription_id, *cycle, *renews_period_end);
        let plan = self.plan(plan_id)?;

        let store = &self.store;
        let plan_ref = &plan;
        let payment_id = payment.id;
        let (sub, previous_plan) = with_persistence_retry(
            &self.policy,
            self.alerts.as_ref(),
            "advance_subscription_period",
            serde_json::json!({
                "payment_id": payment.id,
                "subscription_id": subscription_id,
                "user_id": payment.user_id,
                "amount": payment.amount,
            }),
            move || async move {
                let mut sub = store
                    .get_subscription(subscription_id)
                    .await?
                    .ok_or(BillingError::SubscriptionNotFound)?;
                if sub.current_period_end != renews_period_end
                    || sub.status == SubscriptionStatus::Canceled
                {
                    return Ok((sub, None));
                }

                let previous_plan = sub.plan_id.clone();
                sub.plan_id = plan_ref.id.clone();
                sub.billing_cycle = cycle;
                sub.status = SubscriptionStatus::Active;
                sub.current_period_start = renews_period_end;
                sub.current_period_end = renews_period_end + Duration::days(cycle.days());
                sub.retry_count = 0;
                sub.next_retry_at = None;
                sub.scheduled_plan_id = None;
                sub.scheduled_cycle = None;
                sub.latest_payment_id = Some(payment_id);
                Ok((store.update_subscription(&sub).await?, Some(previous_plan)))
            },
        )
        .await?;

        let Some(previous_plan) = previous_plan else {
            tracing::debug!(
                subscription_id = %subscription_id,
                payment_id = %payment.id,
                "Renewal already applied"
            );
            // still the period this payment bought: finish what an earlier run may have left
            if sub.status.is_live()
                && sub.latest_payment_id == Some(payment.id)
                && sub.current_period_start == renews_period_end
                && sub.plan_id == plan.id
            {
                self.ensure_entitled(payment.user_id, &plan).await?;
                self.grant_period_credits(payment, &plan, cycle, sub.current_period_end)
                    .await?;
            }
            return Ok(sub);
        };

        let plan_changed = previous_plan != plan.id;
        self.entitle(payment.user_id, &plan, plan_changed).await?;
        self.grant_period_credits(payment, &plan, cycle, sub.current_period_end)
            .await?;

        tracing::info!(
            subscription_id = %sub.id,
            user_id = %sub.user_id,
            plan_id = %sub.plan_id,
            period_end = %sub.current_period_end,
            "Subscription renewed"
        );
        Ok(sub)
    }

    async fn record_renewal_failure(
        &self,
        mut sub: Subscription,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<RenewalOutcome> {
        sub.retry_count += 1;

        if sub.retry_count > self.policy.renewal_max_retries {
            tracing::warn!(
                subscription_id = %sub.id,
                user_id = %sub.user_id,
                retry_count = sub.retry_count,
                "Renewal retries exhausted, canceling subscription"
            );
            let subscription = self.finalize_cancel(sub, now).await?;
            return Ok(RenewalOutcome::Canceled { subscription });
        }

        if sub.status != SubscriptionStatus::PastDue {
            ensure_transition(&sub, SubscriptionStatus::PastDue)?;
        }
        let next_retry_at = now + self.policy.renewal_retry_delay(sub.retry_count);
        sub.status = SubscriptionStatus::PastDue;
        sub.next_retry_at = Some(next_retry_at);
        let sub = self.store.update_subscription(&sub).await?;

        tracing::warn!(
            subscription_id = %sub.id,
            user_id = %sub.user_id,
            retry_count = sub.retry_count,
            next_retry_at = %next_retry_at,
            reason = %reason,
            "Renewal failed, subscription past due"
        );
        let plan = self.plan(&sub.plan_id)?;
        self.notify(
            sub.user_id,
            BillingEmails::renewal_failed(&plan, reason, Some(next_retry_at)),
        )
        .await;
        Ok(RenewalOutcome::PastDue { subscription: sub })
    }

    /// Best-effort e-mail to the profile address
    async fn notify(&self, user_id: Uuid, (subject, body): (String, String)) {
        let profile = match self.store.get_profile(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Cannot load profile for email");
                return;
            }
        };
        if let Err(e) = self.mailer.send_email(&profile.email, &subject, &body).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to send billing email");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PaymentError;
    use crate::testing::FakeGateway;
    use crate::BillingService;

    async fn subscribed(plan_id: &str) -> (BillingService, Arc<FakeGateway>, Uuid, Subscription) {
        let (billing, gateway, _, _) = crate::edge_case_tests::harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "sub@example.com").await.unwrap();
        let sub = billing
            .subscriptions
            .subscribe(
                user,
                SubscribeRequest {
                    plan_id: plan_id.into(),
                    cycle: BillingCycle::Monthly,
                    auth_key: "auth_ok".into(),
                    customer_key: format!("cust_{}", user),
                },
            )
            .await
            .unwrap();
        (billing, gateway, user, sub)
    }

    fn card_declined() -> PaymentError {
        PaymentError::terminal("REJECT_CARD_PAYMENT", "Card declined")
    }

    #[tokio::test]
    async fn test_subscribe_activates_and_grants_credits() {
        let (billing, gateway, user, sub) = subscribed("pro").await;
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.is_recurring());
        assert!(!sub.cancel_at_period_end);
        assert_eq!(sub.days_remaining(OffsetDateTime::now_utc()), 30);
        assert_eq!(gateway.charge_count().await, 1);

        let profile = billing.profile(user).await.unwrap();
        assert_eq!(profile.plan_id, "pro");
        assert_eq!(profile.daily_generations_remaining, 50);
        assert_eq!(profile.credits_balance, 300);

        let key = billing
            .store
            .default_billing_key(user)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(key.encrypted_key, format!("bk_cust_{}", user));
        assert_eq!(key.card_number_masked.as_deref(), Some("4330****1234"));
    }

    #[tokio::test]
    async fn test_second_subscription_rejected() {
        let (billing, gateway, user, _) = subscribed("pro").await;
        let err = billing
            .subscriptions
            .subscribe(
                user,
                SubscribeRequest {
                    plan_id: "team".into(),
                    cycle: BillingCycle::Monthly,
                    auth_key: "auth_ok".into(),
                    customer_key: "c".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionAlreadyActive));
        assert_eq!(gateway.charge_count().await, 1);
    }

    #[tokio::test]
    async fn test_declined_first_charge_leaves_no_subscription() {
        let (billing, gateway, _, _) = crate::edge_case_tests::harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "x@example.com").await.unwrap();
        gateway.fail_next_charge(card_declined()).await;

        let err = billing
            .subscriptions
            .subscribe(
                user,
                SubscribeRequest {
                    plan_id: "pro".into(),
                    cycle: BillingCycle::Monthly,
                    auth_key: "auth_ok".into(),
                    customer_key: "c".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REJECT_CARD_PAYMENT");
        assert!(billing.subscriptions.current(user).await.unwrap().is_none());

        let payments = billing.payments.list_payments(user, 10).await.unwrap();
        assert_eq!(payments[0].status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_upgrade_charges_prorated_difference_immediately() {
        let (billing, gateway, user, _) = subscribed("pro").await;

        let outcome = billing
            .subscriptions
            .change_plan(user, "team", BillingCycle::Monthly)
            .await
            .unwrap();
        assert_eq!(outcome.proration.change_type, ChangeType::Upgrade);
        assert_eq!(outcome.subscription.plan_id, "team");
        let payment = outcome.payment.unwrap();
        assert_eq!(payment.amount, outcome.proration.prorated_amount);
        assert!(payment.order_id.starts_with("CHG_"));
        assert_eq!(gateway.charge_count().await, 2);

        let profile = billing.profile(user).await.unwrap();
        assert_eq!(profile.plan_id, "team");
        // 300 from pro + 1,200 upgrade difference
        assert_eq!(profile.credits_balance, 1_500);
    }

    #[tokio::test]
    async fn test_downgrade_is_scheduled_and_applied_at_renewal() {
        let (billing, gateway, user, sub) = subscribed("team").await;

        let outcome = billing
            .subscriptions
            .change_plan(user, "pro", BillingCycle::Monthly)
            .await
            .unwrap();
        assert_eq!(outcome.proration.change_type, ChangeType::Downgrade);
        assert_eq!(outcome.proration.prorated_amount, 0);
        assert_eq!(outcome.proration.effective_date, sub.current_period_end);
        assert!(outcome.payment.is_none());
        assert_eq!(outcome.subscription.plan_id, "team");
        assert_eq!(outcome.subscription.scheduled_plan_id.as_deref(), Some("pro"));

        let at = sub.current_period_end + Duration::minutes(1);
        let renewed = billing.subscriptions.process_renewal(sub.id, at).await.unwrap();
        let RenewalOutcome::Renewed { subscription } = renewed else {
            panic!("expected renewal, got {:?}", renewed);
        };
        assert_eq!(subscription.plan_id, "pro");
        assert!(subscription.scheduled_plan_id.is_none());
        assert_eq!(subscription.current_period_start, sub.current_period_end);
        assert_eq!(
            subscription.current_period_end,
            sub.current_period_end + Duration::days(30)
        );

        let payments = billing.payments.list_payments(user, 10).await.unwrap();
        assert!(payments.iter().any(|p| p.amount == 29_900 && p.status == PaymentStatus::Completed));
        assert_eq!(gateway.charge_count().await, 2);
        assert_eq!(billing.profile(user).await.unwrap().plan_id, "pro");
    }

    #[tokio::test]
    async fn test_same_plan_change_withdraws_schedule() {
        let (billing, _, user, _) = subscribed("team").await;
        billing
            .subscriptions
            .change_plan(user, "pro", BillingCycle::Monthly)
            .await
            .unwrap();
        let outcome = billing
            .subscriptions
            .change_plan(user, "team", BillingCycle::Monthly)
            .await
            .unwrap();
        assert_eq!(outcome.proration.change_type, ChangeType::Same);
        assert!(outcome.subscription.scheduled_plan_id.is_none());
    }

    #[tokio::test]
    async fn test_renewal_not_due_is_skipped() {
        let (billing, gateway, _, sub) = subscribed("pro").await;
        let outcome = billing
            .subscriptions
            .process_renewal(sub.id, OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(matches!(outcome, RenewalOutcome::Skipped { reason: "not_due" }));
        assert_eq!(gateway.charge_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_renewals_go_past_due_then_cancel() {
        let (billing, gateway, user, sub) = subscribed("pro").await;
        let mut at = sub.current_period_end;

        for attempt in 1..=3 {
            gateway.fail_next_charge(card_declined()).await;
            let outcome = billing.subscriptions.process_renewal(sub.id, at).await.unwrap();
            let RenewalOutcome::PastDue { subscription } = outcome else {
                panic!("attempt {} should leave the subscription past due", attempt);
            };
            assert_eq!(subscription.retry_count, attempt);
            let next = subscription.next_retry_at.unwrap();
            assert_eq!(next, at + Duration::days(attempt as i64));
            at = next;
        }

        gateway.fail_next_charge(card_declined()).await;
        let outcome = billing.subscriptions.process_renewal(sub.id, at).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Canceled { .. }));

        let profile = billing.profile(user).await.unwrap();
        assert_eq!(profile.plan_id, "free");
        assert_eq!(profile.daily_generations_remaining, 3);
        assert!(billing.subscriptions.current(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_past_due_retry_success_clears_retry_state() {
        let (billing, gateway, _, sub) = subscribed("pro").await;
        gateway.fail_next_charge(card_declined()).await;
        let at = sub.current_period_end;
        billing.subscriptions.process_renewal(sub.id, at).await.unwrap();

        let retry_at = at + Duration::days(1);
        let outcome = billing
            .subscriptions
            .process_renewal(sub.id, retry_at)
            .await
            .unwrap();
        let RenewalOutcome::Renewed { subscription } = outcome else {
            panic!("retry should renew");
        };
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        assert_eq!(subscription.retry_count, 0);
        assert!(subscription.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_finalizes_without_charge() {
        let (billing, gateway, user, sub) = subscribed("pro").await;
        let flagged = billing.subscriptions.cancel_at_period_end(user).await.unwrap();
        assert!(flagged.cancel_at_period_end);

        // inside the lookahead window but before the end: nothing happens
        let early = sub.current_period_end - Duration::hours(2);
        let outcome = billing.subscriptions.process_renewal(sub.id, early).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Skipped { reason: "awaiting_period_end" }));

        let outcome = billing
            .subscriptions
            .process_renewal(sub.id, sub.current_period_end)
            .await
            .unwrap();
        assert!(matches!(outcome, RenewalOutcome::Canceled { .. }));
        assert_eq!(gateway.charge_count().await, 1);
        assert_eq!(billing.profile(user).await.unwrap().plan_id, "free");
    }

    #[tokio::test]
    async fn test_resume_undoes_scheduled_cancel() {
        let (billing, _, user, _) = subscribed("pro").await;
        billing.subscriptions.cancel_at_period_end(user).await.unwrap();
        let resumed = billing.subscriptions.resume(user).await.unwrap();
        assert!(!resumed.cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_cancel_immediately_twice_is_an_error() {
        let (billing, _, user, sub) = subscribed("pro").await;
        let canceled = billing
            .subscriptions
            .cancel_immediately(user, sub.id)
            .await
            .unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(canceled.canceled_at.is_some());
        assert_eq!(billing.profile(user).await.unwrap().plan_id, "free");

        let err = billing
            .subscriptions
            .cancel_immediately(user, sub.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionAlreadyCanceled));
    }

    #[tokio::test]
    async fn test_pause_and_unpause() {
        let (billing, gateway, user, sub) = subscribed("pro").await;
        let paused = billing.subscriptions.pause(user).await.unwrap();
        assert_eq!(paused.status, SubscriptionStatus::Paused);
        assert!(matches!(
            billing.subscriptions.pause(user).await,
            Err(BillingError::InvalidTransition { .. })
        ));

        // paused subscriptions are not renewed
        let outcome = billing
            .subscriptions
            .process_renewal(sub.id, sub.current_period_end)
            .await
            .unwrap();
        assert!(matches!(outcome, RenewalOutcome::Skipped { .. }));
        assert_eq!(gateway.charge_count().await, 1);

        let active = billing.subscriptions.unpause(user).await.unwrap();
        assert_eq!(active.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_lost_charge_response_is_reconciled_without_recharge() {
        let (billing, gateway, _, sub) = subscribed("pro").await;
        gateway.lose_next_charge_response().await;

        let at = sub.current_period_end;
        let outcome = billing.subscriptions.process_renewal(sub.id, at).await.unwrap();
        assert!(matches!(outcome, RenewalOutcome::Unresolved { .. }));
        assert_eq!(gateway.charge_count().await, 2);

        let outcome = billing.subscriptions.process_renewal(sub.id, at).await.unwrap();
        assert!(matches!(
            outcome,
            RenewalOutcome::Skipped {
                reason: "renewal_in_progress"
            }
        ));

        let later = at + Duration::minutes(15);
        let outcome = billing.subscriptions.process_renewal(sub.id, later).await.unwrap();
        let RenewalOutcome::Renewed { subscription } = outcome else {
            panic!("pending renewal should reconcile as paid");
        };
        assert_eq!(
            subscription.current_period_end,
            sub.current_period_end + Duration::days(30)
        );
        assert_eq!(gateway.charge_count().await, 2);
    }
}
