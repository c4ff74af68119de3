mod common;

use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;

use common::{credits, platform_on, FakePaymentGateway, ORG};
use wellness_backend::billing::{
    AutoTopUpSettings, BillableAction, BillingStore, MeterRequest, PeriodReset, TimeRange,
};
use wellness_backend::db::{Metadata, PgBillingStore, PgModerationStore};
use wellness_backend::moderation::{
    DecisionInput, DecisionKind, ModerationResult, ModerationScores, ModerationStore, QueueStatus,
};
use wellness_backend::organizations::{MemberRole, OrganizationDirectory, PgOrganizationDirectory};

fn postgres_platform(pool: &PgPool) -> common::TestPlatform {
    platform_on(
        Arc::new(PgBillingStore::new(pool.clone())),
        Arc::new(PgModerationStore::new(pool.clone())),
        FakePaymentGateway::approving(),
    )
}

fn scores(overall: f64) -> ModerationScores {
    ModerationScores {
        overall_score: overall,
        age_appropriateness_score: 0.9,
        clinical_safety_score: 0.9,
        cultural_sensitivity_score: 0.9,
        accuracy_score: 0.9,
        flags: Vec::new(),
        recommendations: Vec::new(),
    }
}

// key: postgres-store-tests -> ledger,idempotency,claims,guarded writes,directory
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn ledger_round_trips_through_postgres(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let env = postgres_platform(&pool);
    let meter = &env.platform.meter;
    meter
        .pricing()
        .publish_rate(BillableAction::AiAnalysis, credits(4), credits(0))
        .await
        .unwrap();
    meter
        .add_credits(ORG, credits(100), "seed", Metadata::new(), None)
        .await
        .unwrap();

    let request = MeterRequest::new(ORG, BillableAction::AiAnalysis).idempotency_key("job-1");
    meter
        .execute_with_credits(request.clone(), || async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap();
    meter
        .execute_with_credits(request, || async { Ok::<_, anyhow::Error>(()) })
        .await
        .unwrap();

    let transactions = meter
        .ledger()
        .store()
        .transactions(ORG, TimeRange::all())
        .await
        .unwrap();
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[1].balance_after, credits(96));
    assert_eq!(
        transactions[1].action_type.as_deref(),
        Some(BillableAction::AiAnalysis.as_str())
    );
    assert!(meter.ledger().verify(ORG).await.unwrap().consistent);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn queue_claims_and_decisions_persist(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let env = postgres_platform(&pool);
    let queue = &env.platform.moderation;
    let now = Utc::now();

    let result = ModerationResult::new(ORG, "journal_prompt", 7, Some(500), scores(0.5), now);
    let first = queue.enqueue_for_moderation(result.clone(), now).await.unwrap();
    let again = queue.enqueue_for_moderation(result.clone(), now).await.unwrap();
    assert_eq!(first.item.id, again.item.id);

    let claimed = queue
        .get_next_item_for_user(ORG, 101, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, first.item.id);
    assert!(queue
        .get_next_item_for_user(ORG, 102, now)
        .await
        .unwrap()
        .is_none());

    queue
        .process_decision(ORG, claimed.id, 101, DecisionInput::new(DecisionKind::Approve), now)
        .await
        .unwrap();
    let stored = queue
        .assignments()
        .store()
        .find_item(claimed.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, QueueStatus::Completed);
    let member = queue
        .assignments()
        .store()
        .find_team_member(ORG, 101)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(member.current_load, 0);

    let mut stale = claimed.clone();
    stale.status = QueueStatus::Pending;
    assert!(queue
        .assignments()
        .store()
        .save_item(&stale, QueueStatus::InProgress)
        .await
        .unwrap()
        .is_none());
    assert!(queue
        .assignments()
        .store()
        .save_item(&stale, QueueStatus::Completed)
        .await
        .unwrap()
        .is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn guarded_wallet_writes_hold_in_postgres(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgBillingStore::new(pool.clone());
    store.ensure_wallet(ORG).await.unwrap();
    let settings = AutoTopUpSettings {
        enabled: true,
        threshold: credits(10),
        amount: credits(25),
        monthly_limit: 1,
    };
    store.save_auto_topup(ORG, &settings).await.unwrap();

    let taken = store.record_auto_topup(ORG).await.unwrap().unwrap();
    assert_eq!(taken.auto_topup_count_this_month, 1);
    assert!(store.record_auto_topup(ORG).await.unwrap().is_none());
    let released = store.release_auto_topup(ORG).await.unwrap();
    assert_eq!(released.auto_topup_count_this_month, 0);
    assert_eq!(
        store.release_auto_topup(ORG).await.unwrap().auto_topup_count_this_month,
        0
    );

    store.record_auto_topup(ORG).await.unwrap().unwrap();
    let now = Utc::now();
    assert_eq!(
        store
            .run_period_reset(PeriodReset::MonthlyTopUpCounters, "2026-10", now)
            .await
            .unwrap(),
        Some(1)
    );
    assert_eq!(
        store
            .run_period_reset(PeriodReset::MonthlyTopUpCounters, "2026-10", now)
            .await
            .unwrap(),
        None
    );
    let wallet = store.find_wallet(ORG).await.unwrap().unwrap();
    assert_eq!(wallet.auto_topup_count_this_month, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn directory_reads_member_roles(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    for (user_id, role) in [(10, "admin"), (11, "owner"), (20, "supervisor"), (30, "member")] {
        sqlx::query(
            "INSERT INTO organization_members (organization_id, user_id, role) VALUES ($1, $2, $3)",
        )
        .bind(ORG)
        .bind(user_id)
        .bind(role)
        .execute(&pool)
        .await
        .unwrap();
    }

    let directory = PgOrganizationDirectory::new(pool.clone());
    let mut admins = directory.admins(ORG).await.unwrap();
    admins.sort_unstable();
    assert_eq!(admins, vec![10, 11]);
    assert_eq!(directory.supervisors(ORG).await.unwrap(), vec![20]);
    assert_eq!(
        directory
            .members_with_role(ORG, &[MemberRole::Member])
            .await
            .unwrap(),
        vec![30]
    );
}
