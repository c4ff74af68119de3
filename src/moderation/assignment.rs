use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::error::{ModerationError, ReviewResult};
use super::models::{ModerationQueueItem, ModerationTeamSetting, QueuePriority, QueueStatus};
use super::store::ModerationStore;
use crate::notifications::{dispatch, NotificationCategory, NotificationSink};
use crate::organizations::OrganizationDirectory;

/// Attempts at moving an item whose assignee changes underneath us.
const TRANSFER_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AssignmentStrategy {
    RoundRobin,
    LeastLoaded,
    SkillBased {
        #[serde(default)]
        skills: Vec<String>,
    },
    SpecificUser {
        user_id: i32,
    },
}

impl Default for AssignmentStrategy {
    fn default() -> Self {
        AssignmentStrategy::LeastLoaded
    }
}

/// Moderator after `last` in user-id order, wrapping around.
pub fn select_round_robin(pool: &[ModerationTeamSetting], last: Option<i32>) -> Option<i32> {
    let mut ids: Vec<i32> = pool.iter().map(|member| member.user_id).collect();
    ids.sort_unstable();
    let first = ids.first().copied()?;
    let Some(last) = last else {
        return Some(first);
    };
    Some(ids.into_iter().find(|id| *id > last).unwrap_or(first))
}

/// Lowest load; ties go to the lowest user id.
pub fn select_least_loaded(pool: &[ModerationTeamSetting]) -> Option<i32> {
    pool.iter()
        .min_by_key(|member| (member.current_load, member.user_id))
        .map(|member| member.user_id)
}

/// First moderator (by user id) with any of the skills, else least loaded.
pub fn select_skill_based(pool: &[ModerationTeamSetting], skills: &[String]) -> Option<i32> {
    pool.iter()
        .filter(|member| member.has_any_skill(skills))
        .min_by_key(|member| member.user_id)
        .map(|member| member.user_id)
        .or_else(|| select_least_loaded(pool))
}

// key: moderation-assignment -> strategy selection,load counters,escalation
#[derive(Clone)]
pub struct ModerationAssignmentService {
    store: Arc<dyn ModerationStore>,
    notifier: Arc<dyn NotificationSink>,
    directory: Arc<dyn OrganizationDirectory>,
}

impl ModerationAssignmentService {
    pub fn new(
        store: Arc<dyn ModerationStore>,
        notifier: Arc<dyn NotificationSink>,
        directory: Arc<dyn OrganizationDirectory>,
    ) -> Self {
        Self {
            store,
            notifier,
            directory,
        }
    }

    pub fn store(&self) -> &Arc<dyn ModerationStore> {
        &self.store
    }

    /// Picks a moderator for the organization. `None` when nobody is eligible.
    pub async fn select_assignee(
        &self,
        organization_id: i32,
        strategy: &AssignmentStrategy,
    ) -> ReviewResult<Option<i32>> {
        if let AssignmentStrategy::SpecificUser { user_id } = strategy {
            let member = self.store.find_team_member(organization_id, *user_id).await?;
            return Ok(member.map(|member| member.user_id));
        }

        let pool: Vec<ModerationTeamSetting> = self
            .store
            .team(organization_id)
            .await?
            .into_iter()
            .filter(|member| member.is_available)
            .collect();

        let selected = match strategy {
            AssignmentStrategy::RoundRobin => {
                let last = self.store.last_assigned_user(organization_id).await?;
                select_round_robin(&pool, last)
            }
            AssignmentStrategy::LeastLoaded => select_least_loaded(&pool),
            AssignmentStrategy::SkillBased { skills } => select_skill_based(&pool, skills),
            AssignmentStrategy::SpecificUser { .. } => None,
        };
        Ok(selected)
    }

    /// Assigns the item using `strategy`. Returns `None` when no moderator was
    /// eligible or the item changed hands concurrently.
    pub async fn assign(
        &self,
        item: &ModerationQueueItem,
        strategy: &AssignmentStrategy,
        now: DateTime<Utc>,
    ) -> ReviewResult<Option<ModerationQueueItem>> {
        let Some(assignee) = self.select_assignee(item.organization_id, strategy).await? else {
            info!(
                item_id = %item.id,
                organization_id = item.organization_id,
                ?strategy,
                "no eligible moderator for queue item"
            );
            return Ok(None);
        };

        let updated = self
            .store
            .assign_item(item.id, Some(assignee), item.assigned_to, now)
            .await?;
        if let Some(updated) = &updated {
            self.notify_assignee(updated, assignee, "moderation_item_assigned", json!({}))
                .await;
        }
        Ok(updated)
    }

    /// Moves an open item to `assignee` (or back to the unassigned pool), whoever holds it now.
    pub async fn transfer(
        &self,
        item_id: Uuid,
        assignee: Option<i32>,
        now: DateTime<Utc>,
    ) -> ReviewResult<ModerationQueueItem> {
        for _ in 0..TRANSFER_ATTEMPTS {
            let current = self
                .store
                .find_item(item_id)
                .await?
                .ok_or(ModerationError::ItemNotFound(item_id))?;
            if !current.is_open() {
                return Err(ModerationError::ItemClosed(item_id));
            }
            if current.assigned_to == assignee {
                return Ok(current);
            }
            if let Some(updated) = self
                .store
                .assign_item(item_id, assignee, current.assigned_to, now)
                .await?
            {
                if let Some(user_id) = assignee {
                    self.notify_assignee(&updated, user_id, "moderation_item_assigned", json!({}))
                        .await;
                }
                return Ok(updated);
            }
        }
        warn!(%item_id, ?assignee, "queue item kept changing hands during transfer");
        Err(ModerationError::ItemClosed(item_id))
    }

    /// Marks the item escalated and hands it to the least-loaded supervisor. The item is
    /// re-read before the transition, so a snapshot closed in the meantime stays closed.
    pub async fn escalate(
        &self,
        item: &ModerationQueueItem,
        reason: &str,
        priority: Option<QueuePriority>,
        now: DateTime<Utc>,
    ) -> ReviewResult<ModerationQueueItem> {
        let mut escalated = None;
        for _ in 0..TRANSFER_ATTEMPTS {
            let current = self
                .store
                .find_item(item.id)
                .await?
                .ok_or(ModerationError::ItemNotFound(item.id))?;
            if !current.is_open() {
                return Err(ModerationError::ItemClosed(item.id));
            }

            let mut next = current.clone();
            next.status = QueueStatus::Escalated;
            if let Some(priority) = priority {
                next.priority = priority;
            }
            next.metadata
                .insert("escalation_reason".into(), Value::String(reason.to_string()));
            next.metadata
                .insert("escalated_at".into(), Value::String(now.to_rfc3339()));
            next.updated_at = now;
            escalated = self.store.save_item(&next, current.status).await?;
            if escalated.is_some() {
                break;
            }
        }
        let Some(escalated) = escalated else {
            warn!(item_id = %item.id, "queue item kept changing status during escalation");
            return Err(ModerationError::ItemClosed(item.id));
        };

        let Some(supervisor) = self.pick_supervisor(item.organization_id).await? else {
            warn!(
                item_id = %item.id,
                organization_id = item.organization_id,
                "escalated queue item has no supervisor to receive it"
            );
            return Ok(escalated);
        };

        let updated = self.transfer(item.id, Some(supervisor), now).await?;
        self.notify_assignee(
            &updated,
            supervisor,
            "moderation_item_escalated",
            json!({ "reason": reason }),
        )
        .await;
        info!(
            item_id = %item.id,
            organization_id = item.organization_id,
            supervisor,
            reason,
            "queue item escalated"
        );
        Ok(updated)
    }

    async fn pick_supervisor(&self, organization_id: i32) -> ReviewResult<Option<i32>> {
        let supervisors = match self.directory.supervisors(organization_id).await {
            Ok(supervisors) => supervisors,
            Err(err) => {
                warn!(?err, organization_id, "supervisor lookup failed");
                return Ok(None);
            }
        };
        if supervisors.is_empty() {
            return Ok(None);
        }

        let team: HashMap<i32, ModerationTeamSetting> = self
            .store
            .team(organization_id)
            .await?
            .into_iter()
            .map(|member| (member.user_id, member))
            .collect();
        let candidates: Vec<ModerationTeamSetting> = supervisors
            .iter()
            .map(|user_id| {
                team.get(user_id).cloned().unwrap_or(ModerationTeamSetting {
                    organization_id,
                    user_id: *user_id,
                    is_available: true,
                    current_load: 0,
                    specializations: Vec::new(),
                    updated_at: Utc::now(),
                })
            })
            .collect();
        let available: Vec<ModerationTeamSetting> = candidates
            .iter()
            .filter(|member| member.is_available)
            .cloned()
            .collect();
        if available.is_empty() {
            Ok(select_least_loaded(&candidates))
        } else {
            Ok(select_least_loaded(&available))
        }
    }

    async fn notify_assignee(
        &self,
        item: &ModerationQueueItem,
        user_id: i32,
        event_key: &str,
        extra: Value,
    ) {
        let mut payload = json!({
            "queue_item_id": item.id,
            "priority": item.priority.as_str(),
            "due_at": item.due_at,
        });
        if let (Some(target), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            target.extend(extra);
        }
        dispatch(
            self.notifier.as_ref(),
            &[user_id],
            NotificationCategory::Moderation,
            event_key,
            &payload,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(user_id: i32, load: i32, skills: &[&str]) -> ModerationTeamSetting {
        ModerationTeamSetting {
            organization_id: 1,
            user_id,
            is_available: true,
            current_load: load,
            specializations: skills.iter().map(|skill| skill.to_string()).collect(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn round_robin_rotates_past_last_assignee() {
        let pool = vec![member(7, 0, &[]), member(3, 0, &[]), member(5, 0, &[])];
        assert_eq!(select_round_robin(&pool, None), Some(3));
        assert_eq!(select_round_robin(&pool, Some(3)), Some(5));
        assert_eq!(select_round_robin(&pool, Some(5)), Some(7));
        assert_eq!(select_round_robin(&pool, Some(7)), Some(3));
        // Last assignee left the pool: continue from their position.
        assert_eq!(select_round_robin(&pool, Some(4)), Some(5));
        assert_eq!(select_round_robin(&[], Some(4)), None);
    }

    #[test]
    fn least_loaded_breaks_ties_by_user_id() {
        let pool = vec![member(4, 2, &[]), member(9, 1, &[]), member(2, 1, &[])];
        assert_eq!(select_least_loaded(&pool), Some(2));
    }

    #[test]
    fn skill_based_falls_back_to_least_loaded() {
        let pool = vec![
            member(1, 5, &["clinical"]),
            member(2, 0, &["language"]),
            member(3, 1, &[]),
        ];
        assert_eq!(select_skill_based(&pool, &["clinical".into()]), Some(1));
        assert_eq!(select_skill_based(&pool, &["legal".into()]), Some(2));
    }

    #[test]
    fn strategy_wire_format() {
        let parsed: AssignmentStrategy =
            serde_json::from_value(json!({"strategy": "specific_user", "user_id": 12})).unwrap();
        assert_eq!(parsed, AssignmentStrategy::SpecificUser { user_id: 12 });
        let parsed: AssignmentStrategy =
            serde_json::from_value(json!({"strategy": "skill_based"})).unwrap();
        assert_eq!(parsed, AssignmentStrategy::SkillBased { skills: vec![] });
    }
}
