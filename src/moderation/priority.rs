use super::models::{ModerationScores, QueuePriority};
use crate::config;

/// Queue priority for freshly scored content. Urgent and high checks run before the
/// generic score bands.
pub fn derive_priority(scores: &ModerationScores) -> QueuePriority {
    if scores.overall_score < config::URGENT_OVERALL_SCORE_BELOW
        || scores.clinical_safety_score < config::URGENT_CLINICAL_SAFETY_BELOW
    {
        QueuePriority::Urgent
    } else if scores.overall_score < config::HIGH_OVERALL_SCORE_BELOW
        || scores.flags.len() >= config::HIGH_FLAG_COUNT
    {
        QueuePriority::High
    } else if scores.overall_score <= config::LOW_OVERALL_SCORE_ABOVE {
        QueuePriority::Normal
    } else {
        QueuePriority::Low
    }
}
