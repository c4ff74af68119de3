mod common;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use common::{platform, ORG, SUPERVISOR};
use wellness_backend::moderation::{
    DecisionInput, DecisionKind, ModerationError, ModerationQueueService, ModerationResult,
    ModerationScores, ModerationStatus, ModerationStore, QueuePriority, QueueStatus, SlaPolicy,
};

const OWNER: i32 = 500;
const ALICE: i32 = 101;
const BOB: i32 = 102;

fn scores(overall: f64, clinical: f64) -> ModerationScores {
    ModerationScores {
        overall_score: overall,
        age_appropriateness_score: 0.9,
        clinical_safety_score: clinical,
        cultural_sensitivity_score: 0.9,
        accuracy_score: 0.9,
        flags: Vec::new(),
        recommendations: Vec::new(),
    }
}

fn result(content_id: i64, scores: ModerationScores, now: DateTime<Utc>) -> ModerationResult {
    ModerationResult::new(ORG, "journal_prompt", content_id, Some(OWNER), scores, now)
}

async fn join_team(queue: &ModerationQueueService, user_id: i32, now: DateTime<Utc>) {
    queue
        .update_team_member(ORG, user_id, true, Vec::new(), now)
        .await
        .unwrap();
}

async fn load_of(queue: &ModerationQueueService, user_id: i32) -> i32 {
    queue
        .assignments()
        .store()
        .find_team_member(ORG, user_id)
        .await
        .unwrap()
        .map(|member| member.current_load)
        .unwrap_or(0)
}

// key: moderation-queue-tests -> enqueue,claim,decide,escalate,sla
#[tokio::test]
async fn enqueue_derives_priority_and_due_date() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();

    let urgent = queue
        .enqueue_for_moderation(result(1, scores(0.3, 0.9), now), now)
        .await
        .unwrap();
    assert_eq!(urgent.item.priority, QueuePriority::Urgent);
    assert_eq!(urgent.item.due_at, Some(now + Duration::hours(4)));
    assert_eq!(urgent.item.status, QueueStatus::Pending);
    assert_eq!(urgent.item.assigned_to, None);
    assert!(urgent.workflow.is_none());

    let low = queue
        .enqueue_for_moderation(result(2, scores(0.95, 0.95), now), now)
        .await
        .unwrap();
    assert_eq!(low.item.priority, QueuePriority::Low);
    assert_eq!(low.item.due_at, Some(now + Duration::hours(72)));
}

#[tokio::test]
async fn enqueue_is_idempotent_per_result() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    let scored = result(7, scores(0.7, 0.9), now);

    let first = queue.enqueue_for_moderation(scored.clone(), now).await.unwrap();
    let second = queue.enqueue_for_moderation(scored, now).await.unwrap();
    assert_eq!(first.item.id, second.item.id);
    assert_eq!(
        queue
            .get_queue_for_user(ORG, ALICE, None, None)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn enqueue_spreads_work_across_the_least_loaded_team() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    join_team(queue, ALICE, now).await;
    join_team(queue, BOB, now).await;

    let mut assignees = Vec::new();
    for content_id in 0..3 {
        let enqueued = queue
            .enqueue_for_moderation(result(content_id, scores(0.7, 0.9), now), now)
            .await
            .unwrap();
        assignees.push(enqueued.item.assigned_to);
    }
    assert_eq!(assignees, vec![Some(ALICE), Some(BOB), Some(ALICE)]);
    assert_eq!(load_of(queue, ALICE).await, 2);
    assert_eq!(load_of(queue, BOB).await, 1);
    assert_eq!(env.notifier.count("moderation_item_assigned"), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_hand_out_an_item_once() {
    let env = platform();
    let queue = env.platform.moderation.clone();
    let now = Utc::now();
    queue
        .enqueue_for_moderation(result(1, scores(0.7, 0.9), now), now)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for user_id in [ALICE, BOB, 103, 104] {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue
                .get_next_item_for_user(ORG, user_id, Utc::now())
                .await
                .unwrap()
                .map(|item| (user_id, item))
        }));
    }
    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(claim) = handle.await.unwrap() {
            claimed.push(claim);
        }
    }

    assert_eq!(claimed.len(), 1);
    let (winner, item) = &claimed[0];
    assert_eq!(item.assigned_to, Some(*winner));
    assert_eq!(item.status, QueueStatus::InProgress);
    assert_eq!(load_of(&queue, *winner).await, 1);
}

#[tokio::test]
async fn next_item_prefers_urgent_work() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    queue
        .enqueue_for_moderation(result(1, scores(0.7, 0.9), now), now)
        .await
        .unwrap();
    let urgent = queue
        .enqueue_for_moderation(result(2, scores(0.7, 0.2), now + Duration::seconds(1)), now)
        .await
        .unwrap();

    let next = queue
        .get_next_item_for_user(ORG, ALICE, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.id, urgent.item.id);
    assert_eq!(next.priority, QueuePriority::Urgent);
}

#[tokio::test]
async fn approval_completes_the_item_and_releases_load() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    let enqueued = queue
        .enqueue_for_moderation(result(1, scores(0.7, 0.9), now), now)
        .await
        .unwrap();
    let item = queue
        .get_next_item_for_user(ORG, ALICE, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(load_of(queue, ALICE).await, 1);

    let outcome = queue
        .process_decision(
            ORG,
            item.id,
            ALICE,
            DecisionInput::new(DecisionKind::Approve).notes("looks good"),
            now + Duration::minutes(3),
        )
        .await
        .unwrap();
    assert_eq!(outcome.item.status, QueueStatus::Completed);
    assert_eq!(outcome.decision.time_spent_seconds, 180);
    assert_eq!(load_of(queue, ALICE).await, 0);

    let stored = queue
        .assignments()
        .store()
        .find_result(enqueued.item.moderation_result_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ModerationStatus::Approved);
    assert!(stored.human_reviewed);
    assert_eq!(stored.reviewed_by, Some(ALICE));
    assert_eq!(env.notifier.events_for(OWNER), vec!["moderation_approve"]);

    let again = queue
        .process_decision(ORG, item.id, ALICE, DecisionInput::new(DecisionKind::Reject), now)
        .await
        .unwrap_err();
    assert!(matches!(again, ModerationError::ItemClosed(_)));
}

#[tokio::test]
async fn request_changes_and_skip_return_the_item_to_pending() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    queue
        .enqueue_for_moderation(result(1, scores(0.7, 0.9), now), now)
        .await
        .unwrap();
    let item = queue
        .get_next_item_for_user(ORG, ALICE, now)
        .await
        .unwrap()
        .unwrap();

    let changes = queue
        .process_decision(
            ORG,
            item.id,
            ALICE,
            DecisionInput::new(DecisionKind::RequestChanges),
            now,
        )
        .await
        .unwrap();
    assert_eq!(changes.item.status, QueueStatus::Pending);
    assert_eq!(changes.item.assigned_to, Some(ALICE));

    let skipped = queue
        .process_decision(ORG, item.id, ALICE, DecisionInput::new(DecisionKind::Skip), now)
        .await
        .unwrap();
    assert_eq!(skipped.item.status, QueueStatus::Pending);
    assert_eq!(skipped.item.assigned_to, None);
    assert_eq!(load_of(queue, ALICE).await, 0);

    let missing = queue
        .process_decision(ORG, item.id, ALICE, DecisionInput::default(), now)
        .await
        .unwrap_err();
    assert!(matches!(missing, ModerationError::InvalidInput(_)));
}

#[tokio::test]
async fn reassignment_moves_load_and_records_the_previous_owner() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    let enqueued = queue
        .enqueue_for_moderation(result(1, scores(0.7, 0.9), now), now)
        .await
        .unwrap();

    queue
        .assign_to_user(ORG, enqueued.item.id, ALICE, now)
        .await
        .unwrap();
    let moved = queue
        .reassign(ORG, enqueued.item.id, BOB, now)
        .await
        .unwrap();
    assert_eq!(moved.assigned_to, Some(BOB));
    assert_eq!(moved.metadata["reassigned_from"], json!(ALICE));
    assert_eq!(load_of(queue, ALICE).await, 0);
    assert_eq!(load_of(queue, BOB).await, 1);

    let other_org = queue.reassign(ORG + 1, enqueued.item.id, ALICE, now).await;
    assert!(matches!(other_org, Err(ModerationError::ItemNotFound(_))));
}

#[tokio::test]
async fn overdue_items_escalate_to_a_supervisor() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    let earlier = now - Duration::hours(5);
    let enqueued = queue
        .enqueue_for_moderation(result(1, scores(0.3, 0.9), earlier), earlier)
        .await
        .unwrap();
    queue
        .enqueue_for_moderation(result(2, scores(0.7, 0.9), earlier), earlier)
        .await
        .unwrap();

    let summary = queue.escalate_overdue_items(now).await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.escalated, 1);

    let item = queue
        .assignments()
        .store()
        .find_item(enqueued.item.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.status, QueueStatus::Escalated);
    assert_eq!(item.assigned_to, Some(SUPERVISOR));
    assert_eq!(item.metadata["escalation_reason"], json!("sla deadline passed"));
    assert_eq!(
        env.notifier.events_for(SUPERVISOR),
        vec!["moderation_item_assigned", "moderation_item_escalated"]
    );

    let again = queue.escalate_overdue_items(now).await.unwrap();
    assert_eq!(again.checked, 0);
}

#[tokio::test]
async fn moderator_escalation_hands_the_item_to_a_supervisor() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    let enqueued = queue
        .enqueue_for_moderation(result(1, scores(0.7, 0.9), now), now)
        .await
        .unwrap();
    let item = queue
        .get_next_item_for_user(ORG, ALICE, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(load_of(queue, ALICE).await, 1);

    let outcome = queue
        .process_decision(
            ORG,
            item.id,
            ALICE,
            DecisionInput::new(DecisionKind::Escalate).notes("mentions self harm"),
            now,
        )
        .await
        .unwrap();
    assert_eq!(outcome.item.status, QueueStatus::Escalated);
    assert_eq!(outcome.item.assigned_to, Some(SUPERVISOR));
    assert_eq!(outcome.item.completed_at, None);
    assert_eq!(outcome.item.metadata["escalation_reason"], json!("mentions self harm"));
    assert_eq!(outcome.decision.decision, DecisionKind::Escalate);
    assert_eq!(load_of(queue, ALICE).await, 0);
    assert_eq!(load_of(queue, SUPERVISOR).await, 1);

    let stored = queue
        .assignments()
        .store()
        .find_result(enqueued.item.moderation_result_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ModerationStatus::Escalated);
    assert_eq!(stored.reviewed_by, Some(ALICE));
    assert_eq!(env.notifier.events_for(OWNER), vec!["moderation_escalate"]);
    assert!(env
        .notifier
        .events_for(SUPERVISOR)
        .contains(&"moderation_item_escalated".to_string()));

    let supervisor_queue = queue
        .get_queue_for_user(ORG, SUPERVISOR, None, None)
        .await
        .unwrap();
    assert_eq!(supervisor_queue.len(), 1);
    assert_eq!(supervisor_queue[0].id, item.id);
}

#[tokio::test]
async fn escalating_a_stale_snapshot_leaves_a_completed_item_closed() {
    let env = platform();
    let queue = &env.platform.moderation;
    let store = queue.assignments().store().clone();
    let now = Utc::now();
    queue
        .enqueue_for_moderation(result(1, scores(0.3, 0.9), now), now)
        .await
        .unwrap();
    let stale = queue
        .get_next_item_for_user(ORG, ALICE, now)
        .await
        .unwrap()
        .unwrap();
    queue
        .process_decision(ORG, stale.id, ALICE, DecisionInput::new(DecisionKind::Approve), now)
        .await
        .unwrap();

    let escalation = queue
        .assignments()
        .escalate(&stale, "sla deadline passed", None, now + Duration::hours(5))
        .await;
    assert!(matches!(escalation, Err(ModerationError::ItemClosed(_))));

    let mut reopened = stale.clone();
    reopened.status = QueueStatus::Pending;
    assert!(store
        .save_item(&reopened, QueueStatus::InProgress)
        .await
        .unwrap()
        .is_none());
    assert!(store
        .save_item(&reopened, QueueStatus::Completed)
        .await
        .unwrap()
        .is_none());

    let item = store.find_item(stale.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Completed);
    assert_eq!(item.completed_at, Some(now));
    assert_eq!(item.assigned_to, Some(ALICE));
    assert_eq!(load_of(queue, ALICE).await, 0);
    assert_eq!(load_of(queue, SUPERVISOR).await, 0);
    assert!(env.notifier.events_for(SUPERVISOR).is_empty());
    assert!(queue
        .get_queue_for_user(ORG, SUPERVISOR, None, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn stats_report_sla_compliance_over_the_window() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    let created = now - Duration::hours(100);

    for content_id in 0..10 {
        let enqueued = queue
            .enqueue_for_moderation(result(content_id, scores(0.7, 0.9), created), created)
            .await
            .unwrap();
        let decided_at = if content_id < 7 {
            created + Duration::hours(1)
        } else {
            now
        };
        queue
            .process_decision(
                ORG,
                enqueued.item.id,
                ALICE,
                DecisionInput::new(DecisionKind::Approve),
                decided_at,
            )
            .await
            .unwrap();
    }
    queue
        .enqueue_for_moderation(result(99, scores(0.5, 0.9), now), now)
        .await
        .unwrap();

    let stats = queue.get_queue_stats(ORG, now).await.unwrap();
    assert_eq!(stats.completed_in_window, 10);
    assert_eq!(stats.sla_compliance, 70.0);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.unassigned, 1);
    assert_eq!(stats.by_priority["high"], 1);
    assert_eq!(stats.by_priority["urgent"], 0);

    let mine = queue.get_user_stats(ORG, ALICE, now).await.unwrap();
    assert_eq!(mine.decisions, 10);
    assert_eq!(mine.decisions_by_kind["approve"], 10);
    assert_eq!(mine.open_items, 0);
}

#[tokio::test]
async fn sla_policy_drives_due_dates() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    let mut policy = queue.sla_policy(ORG).await.unwrap();
    policy.normal_hours = 12;
    queue.set_sla_policy(ORG, policy).await.unwrap();

    let enqueued = queue
        .enqueue_for_moderation(result(1, scores(0.7, 0.9), now), now)
        .await
        .unwrap();
    assert_eq!(enqueued.item.due_at, Some(now + Duration::hours(12)));

    policy.urgent_hours = 0;
    assert!(matches!(
        queue.set_sla_policy(ORG, policy).await,
        Err(ModerationError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn out_of_range_sla_hours_never_reach_enqueue() {
    let env = platform();
    let queue = &env.platform.moderation;
    let now = Utc::now();
    let huge = SlaPolicy {
        urgent_hours: i64::MAX / 2,
        ..SlaPolicy::default()
    };
    assert!(matches!(
        queue.set_sla_policy(ORG, huge).await,
        Err(ModerationError::InvalidInput(_))
    ));

    queue
        .assignments()
        .store()
        .save_sla_policy(ORG, &huge)
        .await
        .unwrap();
    assert_eq!(queue.sla_policy(ORG).await.unwrap(), SlaPolicy::default());
    let enqueued = queue
        .enqueue_for_moderation(result(1, scores(0.3, 0.9), now), now)
        .await
        .unwrap();
    assert_eq!(enqueued.item.priority, QueuePriority::Urgent);
    assert_eq!(enqueued.item.due_at, Some(now + Duration::hours(4)));
}
