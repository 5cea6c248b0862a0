//! Scheduling score (§4.5.2): deterministic, monotonic in the intended
//! direction. Priority dominates; wait time and fair-share break ties and
//! prevent starvation.
//!
//! ```text
//! score = (4 − priority) · 1000
//!       + wait_minutes
//!       + fair_share_bonus
//! fair_share_bonus = minutes_since_user_last_scheduled, or 1000 if never
//!                    scheduled (only when fair-share is enabled and a
//!                    submitter identity is present)
//! ```

use chrono::{DateTime, Utc};

use crate::store::QueueRow;

const NEVER_SCHEDULED_BONUS: f64 = 1000.0;

pub(crate) fn score(
    row: &QueueRow,
    now: DateTime<Utc>,
    fair_share_enabled: bool,
    last_scheduled: Option<DateTime<Utc>>,
) -> f64 {
    let priority_component = (4 - row.priority as i32) as f64 * 1000.0;
    let wait_minutes = (now - row.enqueued_at).num_seconds().max(0) as f64 / 60.0;

    let fair_share_bonus = if fair_share_enabled && row.submitter_id.is_some() {
        match last_scheduled {
            Some(last) => (now - last).num_seconds().max(0) as f64 / 60.0,
            None => NEVER_SCHEDULED_BONUS,
        }
    } else {
        0.0
    };

    priority_component + wait_minutes + fair_share_bonus
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn row(priority: u8, enqueued_at: DateTime<Utc>, submitter: Option<&str>) -> QueueRow {
        QueueRow {
            job_id: Uuid::now_v7(),
            priority,
            enqueued_at,
            dependencies: vec![],
            retry_count: 0,
            max_retries: 3,
            runner_type: "local".into(),
            cluster_id: None,
            submitter_id: submitter.map(|s| s.to_string()),
            resources: HashMap::new(),
        }
    }

    #[test]
    fn priority_dominates_wait_time() {
        let now = Utc::now();
        let high_priority_fresh = row(0, now, None);
        let low_priority_ancient = row(4, now - Duration::days(30), None);
        assert!(
            score(&high_priority_fresh, now, false, None)
                > score(&low_priority_ancient, now, false, None)
        );
    }

    #[test]
    fn older_wins_within_same_priority() {
        let now = Utc::now();
        let older = row(2, now - Duration::minutes(30), None);
        let newer = row(2, now - Duration::minutes(5), None);
        assert!(score(&older, now, false, None) > score(&newer, now, false, None));
    }

    #[test]
    fn fair_share_only_applies_when_enabled_and_submitter_present() {
        let now = Utc::now();
        let with_submitter = row(2, now, Some("alice"));
        let without = score(&with_submitter, now, false, None);
        let with = score(&with_submitter, now, true, None);
        assert!(with > without);

        let no_submitter = row(2, now, None);
        assert_eq!(
            score(&no_submitter, now, true, None),
            score(&no_submitter, now, false, None)
        );
    }

    #[test]
    fn never_scheduled_gets_full_bonus() {
        let now = Utc::now();
        let r = row(2, now, Some("bob"));
        let never = score(&r, now, true, None);
        let recently = score(&r, now, true, Some(now - Duration::minutes(1)));
        assert!(never > recently);
    }
}
