mod common;

use std::sync::Arc;

use rust_decimal::Decimal;

use common::{
    credits, platform, platform_on, platform_with, FakePaymentGateway, FlakyBillingStore, ADMIN,
    ORG,
};
use wellness_backend::billing::{
    AutoTopUpSettings, BillingError, BillingStore, TimeRange, TopUpOutcome,
};
use wellness_backend::db::Metadata;
use wellness_backend::moderation::MemoryModerationStore;

fn settings(threshold: i64, amount: i64, monthly_limit: i32) -> AutoTopUpSettings {
    AutoTopUpSettings {
        enabled: true,
        threshold: credits(threshold),
        amount: credits(amount),
        monthly_limit,
    }
}

async fn seed(env: &common::TestPlatform, balance: i64) {
    env.platform
        .meter
        .add_credits(ORG, credits(balance), "seed", Metadata::new(), None)
        .await
        .unwrap();
}

// key: auto-topup-tests -> charge,cap,grace
#[tokio::test]
async fn balance_at_threshold_buys_credits_at_the_tier_rate() {
    let env = platform();
    seed(&env, 15).await;
    env.platform
        .top_up
        .configure(ORG, settings(20, 50, 3))
        .await
        .unwrap();

    let outcome = env.platform.top_up.process_if_needed(ORG).await.unwrap();
    match outcome {
        TopUpOutcome::Succeeded {
            credits_added,
            transaction,
        } => {
            assert_eq!(credits_added, credits(500));
            assert_eq!(transaction.balance_after, credits(515));
            assert_eq!(transaction.metadata["source"], "auto_topup");
        }
        other => panic!("expected a successful top-up, got {other:?}"),
    }
    assert_eq!(env.gateway.charged(), vec![(ORG, credits(50))]);

    let balance = env.platform.meter.get_balance(ORG).await.unwrap();
    assert_eq!(balance.balance, credits(515));
    assert_eq!(balance.auto_topup_count_this_month, 1);
    assert!(balance.grace_period_until.is_none());
    assert_eq!(env.notifier.events_for(ADMIN), vec!["auto_topup_succeeded"]);
}

#[tokio::test]
async fn balance_above_threshold_is_left_alone() {
    let env = platform();
    seed(&env, 21).await;
    env.platform
        .top_up
        .configure(ORG, settings(20, 50, 3))
        .await
        .unwrap();

    let outcome = env.platform.top_up.process_if_needed(ORG).await.unwrap();
    assert!(matches!(outcome, TopUpOutcome::NotNeeded));
    assert_eq!(env.gateway.charge_attempts(), 0);
}

#[tokio::test]
async fn declined_charge_opens_a_grace_period() {
    let env = platform_with(FakePaymentGateway::declining());
    seed(&env, 5).await;
    env.platform
        .top_up
        .configure(ORG, settings(20, 50, 3))
        .await
        .unwrap();

    let outcome = env.platform.top_up.process_if_needed(ORG).await.unwrap();
    let TopUpOutcome::Failed {
        reason,
        grace_until,
    } = outcome
    else {
        panic!("expected a failed top-up");
    };
    assert_eq!(reason, "card declined");
    assert!(grace_until.is_some());

    let balance = env.platform.meter.get_balance(ORG).await.unwrap();
    assert!(balance.in_grace_period);
    assert_eq!(balance.balance, credits(5));
    assert_eq!(balance.auto_topup_count_this_month, 0);
    assert_eq!(env.notifier.count("auto_topup_failed"), 1);

    // A later success closes the grace period.
    env.gateway.set_succeed(true);
    let outcome = env.platform.top_up.process_if_needed(ORG).await.unwrap();
    assert!(matches!(outcome, TopUpOutcome::Succeeded { .. }));
    assert!(!env.platform.meter.get_balance(ORG).await.unwrap().in_grace_period);
}

#[tokio::test]
async fn monthly_cap_stops_charging() {
    let env = platform();
    seed(&env, 1).await;
    env.platform
        .top_up
        .configure(ORG, settings(1_000, 10, 1))
        .await
        .unwrap();

    let first = env.platform.top_up.process_if_needed(ORG).await.unwrap();
    assert!(matches!(first, TopUpOutcome::Succeeded { .. }));
    let second = env.platform.top_up.process_if_needed(ORG).await.unwrap();
    assert!(matches!(second, TopUpOutcome::LimitReached));
    assert_eq!(env.gateway.charge_attempts(), 1);
    assert_eq!(env.notifier.count("auto_topup_limit_reached"), 1);
}

#[tokio::test]
async fn concurrent_runs_never_exceed_the_monthly_cap() {
    let env = platform_with(FakePaymentGateway::approving().yielding());
    seed(&env, 5).await;
    env.platform
        .top_up
        .configure(ORG, settings(20, 50, 1))
        .await
        .unwrap();

    let top_up = &env.platform.top_up;
    let (first, second) = tokio::join!(top_up.process_if_needed(ORG), top_up.process_if_needed(ORG));
    let outcomes = [first.unwrap(), second.unwrap()];
    let succeeded = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, TopUpOutcome::Succeeded { .. }))
        .count();
    let capped = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, TopUpOutcome::LimitReached))
        .count();
    assert_eq!((succeeded, capped), (1, 1));
    assert_eq!(env.gateway.charge_attempts(), 1);

    let balance = env.platform.meter.get_balance(ORG).await.unwrap();
    assert_eq!(balance.auto_topup_count_this_month, 1);
    assert_eq!(balance.balance, credits(505));
}

#[tokio::test]
async fn lost_ledger_ack_after_a_charge_credits_once() {
    let store = Arc::new(FlakyBillingStore::default());
    let env = platform_on(
        store.clone(),
        Arc::new(MemoryModerationStore::new()),
        FakePaymentGateway::approving(),
    );
    seed(&env, 5).await;
    env.platform
        .top_up
        .configure(ORG, settings(20, 50, 3))
        .await
        .unwrap();

    store.lose_next_acks(1);
    let outcome = env.platform.top_up.process_if_needed(ORG).await.unwrap();
    let TopUpOutcome::Succeeded { transaction, .. } = outcome else {
        panic!("expected the retried credit to succeed");
    };
    assert_eq!(transaction.balance_after, credits(505));
    assert_eq!(transaction.metadata["charge_id"], "ch_test_1");
    assert_eq!(
        transaction.idempotency_key.as_deref(),
        Some("auto_topup:ch_test_1")
    );

    let top_ups = store
        .transactions(ORG, TimeRange::all())
        .await
        .unwrap()
        .into_iter()
        .filter(|transaction| {
            transaction
                .metadata
                .get("source")
                .and_then(|source| source.as_str())
                == Some("auto_topup")
        })
        .count();
    assert_eq!(top_ups, 1);
    assert_eq!(env.gateway.charge_attempts(), 1);
    let balance = env.platform.meter.get_balance(ORG).await.unwrap();
    assert_eq!(balance.balance, credits(505));
    assert_eq!(balance.auto_topup_count_this_month, 1);
}

#[tokio::test]
async fn charge_that_cannot_be_recorded_still_counts_against_the_cap() {
    let store = Arc::new(FlakyBillingStore::default());
    let env = platform_on(
        store.clone(),
        Arc::new(MemoryModerationStore::new()),
        FakePaymentGateway::approving(),
    );
    seed(&env, 5).await;
    env.platform
        .top_up
        .configure(ORG, settings(20, 50, 3))
        .await
        .unwrap();

    store.lose_next_acks(10);
    let result = env.platform.top_up.process_if_needed(ORG).await;
    assert!(matches!(result, Err(BillingError::Store(_))));
    store.lose_next_acks(0);

    let balance = env.platform.meter.get_balance(ORG).await.unwrap();
    assert_eq!(balance.balance, credits(505));
    assert_eq!(balance.auto_topup_count_this_month, 1);
    assert_eq!(env.gateway.charge_attempts(), 1);
}

#[tokio::test]
async fn missing_card_skips_without_charging() {
    let env = platform_with(FakePaymentGateway::without_card());
    seed(&env, 5).await;
    env.platform
        .top_up
        .configure(ORG, settings(20, 50, 3))
        .await
        .unwrap();

    let outcome = env.platform.top_up.process_if_needed(ORG).await.unwrap();
    assert!(matches!(outcome, TopUpOutcome::NoPaymentMethod));
    assert_eq!(env.gateway.charge_attempts(), 0);
    let balance = env.platform.meter.get_balance(ORG).await.unwrap();
    assert!(!balance.in_grace_period);
    assert_eq!(balance.auto_topup_count_this_month, 0);
}

#[tokio::test]
async fn sweep_processes_only_eligible_wallets() {
    let env = platform();
    seed(&env, 5).await;
    env.platform
        .top_up
        .configure(ORG, settings(20, 50, 3))
        .await
        .unwrap();
    env.platform
        .meter
        .add_credits(2, credits(500), "seed", Metadata::new(), None)
        .await
        .unwrap();
    env.platform
        .top_up
        .configure(2, settings(20, 50, 3))
        .await
        .unwrap();
    env.platform
        .meter
        .add_credits(3, credits(1), "seed", Metadata::new(), None)
        .await
        .unwrap();

    let summary = env.platform.top_up.process_all_pending().await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(env.gateway.charged(), vec![(ORG, credits(50))]);
}

#[tokio::test]
async fn invalid_settings_are_rejected() {
    let env = platform();
    let zero_amount = AutoTopUpSettings {
        amount: Decimal::ZERO,
        ..settings(20, 50, 3)
    };
    assert!(matches!(
        env.platform.top_up.configure(ORG, zero_amount).await,
        Err(BillingError::InvalidAmount(_))
    ));
    assert!(matches!(
        env.platform.top_up.configure(ORG, settings(-1, 50, 3)).await,
        Err(BillingError::InvalidAmount(_))
    ));
}
