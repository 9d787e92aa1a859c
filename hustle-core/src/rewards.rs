//! Reward ledger - experience, trust tiers, and badges
//!
//! Awards are coupled to payout release and written in the caller's
//! transaction. The xp ledger is unique per task, so a re-run after a
//! partial commit awards at most once. Levels, tiers, and badges only
//! ever move up; nothing in this module decrements.

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::models::{BadgeAward, EscrowHold, Task, TaskCategory, TrustChange, XpEntry};
use crate::store::StoreTx;
use crate::CoreResult;

/// Configuration for reward computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardConfig {
    /// Window over which recent awards depress the decay factor
    pub decay_window_hours: i64,
    /// Decay removed per award inside the window
    pub decay_step: f64,
    /// Decay never drops below this floor
    pub decay_floor: f64,
    /// Streak bonus added per consecutive active day
    pub streak_step: f64,
    /// Days of streak that still increase the bonus
    pub streak_cap_days: i64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            decay_window_hours: 24,
            decay_step: 0.15,
            decay_floor: 0.2,
            streak_step: 0.1,
            streak_cap_days: 10, // bonus tops out at 2.0x
        }
    }
}

/// Cumulative totals that unlock each level, index = level - 1
const LEVEL_THRESHOLDS: &[i64] = &[
    0, 100, 250, 500, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000,
];

/// Result of an award attempt
#[derive(Debug, Clone)]
pub struct AwardResult {
    /// True when the task already had an award; nothing was applied
    pub already_awarded: bool,
    /// Points applied by this call (zero on replay)
    pub applied: i64,
    pub entry: Option<XpEntry>,
    pub new_level: i32,
    pub old_tier: i16,
    pub new_tier: i16,
    /// Badge ids newly appended by this award
    pub badges: Vec<String>,
}

/// Base points by task category
fn category_base(category: TaskCategory) -> i64 {
    match category {
        TaskCategory::Errand => 50,
        TaskCategory::Delivery => 60,
        TaskCategory::Yardwork => 70,
        TaskCategory::Cleaning => 80,
        TaskCategory::Assembly => 90,
        TaskCategory::Tech => 100,
        TaskCategory::Moving => 120,
        TaskCategory::Other => 40,
    }
}

/// Price tier multiplier on the base, from the gross amount in cents
fn price_tier_multiplier(gross_amount: i64) -> f64 {
    match gross_amount {
        i64::MIN..=2_499 => 1.0,
        2_500..=9_999 => 1.25,
        10_000..=24_999 => 1.5,
        25_000..=99_999 => 2.0,
        _ => 2.5,
    }
}

/// Deterministic base amount from category and price tier
pub fn base_amount(category: TaskCategory, gross_amount: i64) -> i64 {
    (category_base(category) as f64 * price_tier_multiplier(gross_amount)).round() as i64
}

/// Level from total points; monotone lookup
pub fn level_for(total_points: i64) -> i32 {
    LEVEL_THRESHOLDS
        .iter()
        .take_while(|threshold| total_points >= **threshold)
        .count() as i32
}

/// Trust tier from level; tiers are ordered 1..5
pub fn tier_for(level: i32) -> i16 {
    match level {
        i32::MIN..=2 => 1,
        3..=4 => 2,
        5..=6 => 3,
        7..=8 => 4,
        _ => 5,
    }
}

/// Consecutive active days ending with `today`, given distinct prior
/// award days sorted most recent first. The award being written counts
/// `today` as active.
fn current_streak(days: &[NaiveDate], today: NaiveDate) -> i64 {
    let mut streak = 1;
    let mut expected = today - Duration::days(1);
    for day in days {
        if *day >= today {
            continue;
        }
        if *day == expected {
            streak += 1;
            expected -= Duration::days(1);
        } else {
            break;
        }
    }
    streak
}

/// Awards experience and applies tier and badge consequences
pub struct RewardLedger {
    config: RewardConfig,
}

impl RewardLedger {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    /// Anti-grind multiplier in [floor, 1.0]; drops as recent velocity rises
    pub fn decay_factor(&self, recent_award_count: usize) -> f64 {
        (1.0 - self.config.decay_step * recent_award_count as f64).max(self.config.decay_floor)
    }

    /// Streak bonus in [1.0, 2.0]
    pub fn streak_multiplier(&self, streak_days: i64) -> f64 {
        let counted = (streak_days - 1).clamp(0, self.config.streak_cap_days);
        (1.0 + self.config.streak_step * counted as f64).min(2.0)
    }

    /// Award experience for a released task, inside the caller's
    /// transaction. Idempotent per task: a second call reports
    /// `already_awarded` and applies nothing.
    pub async fn award_for_task(
        &self,
        tx: &mut dyn StoreTx,
        task: &Task,
        worker_id: Uuid,
        hold: &EscrowHold,
    ) -> CoreResult<AwardResult> {
        let now = Utc::now();
        let window_start = now - Duration::hours(self.config.decay_window_hours);
        let recent = tx.recent_awards(worker_id, window_start).await?;
        let days = tx.award_days(worker_id, 60).await?;

        let streak = current_streak(&days, now.date_naive());
        let base = base_amount(task.category, hold.gross_amount);
        let decay = self.decay_factor(recent.len());
        let multiplier = self.streak_multiplier(streak);
        let final_amount = (base as f64 * decay * multiplier).round() as i64;

        let entry = XpEntry {
            id: Uuid::new_v4(),
            user_id: worker_id,
            task_id: task.id,
            base_amount: base,
            decay_factor: decay,
            streak_multiplier: multiplier,
            final_amount,
            awarded_at: now,
        };

        if !tx.insert_xp_entry(&entry).await? {
            let tier = tx.current_tier(worker_id).await?;
            let level = level_for(tx.xp_total(worker_id).await?);
            return Ok(AwardResult {
                already_awarded: true,
                applied: 0,
                entry: None,
                new_level: level,
                old_tier: tier,
                new_tier: tier,
                badges: Vec::new(),
            });
        }

        let total = tx.xp_total(worker_id).await?;
        let new_level = level_for(total);
        let old_tier = tx.current_tier(worker_id).await?;
        let target_tier = tier_for(new_level);

        // Tiers never move down; a change always lands in the trust ledger
        let new_tier = if target_tier > old_tier {
            tx.append_trust_change(&TrustChange {
                id: Uuid::new_v4(),
                user_id: worker_id,
                old_tier,
                new_tier: target_tier,
                reason: format!("reached level {new_level}"),
                awarded_at: now,
            })
            .await?;
            info!(%worker_id, old_tier, new_tier = target_tier, "trust tier upgraded");
            target_tier
        } else {
            old_tier
        };

        let badges = self.evaluate_badges(tx, worker_id, streak).await?;

        info!(
            %worker_id,
            task_id = %task.id,
            base,
            decay,
            multiplier,
            final_amount,
            "experience awarded"
        );

        Ok(AwardResult {
            already_awarded: false,
            applied: final_amount,
            entry: Some(entry),
            new_level,
            old_tier,
            new_tier,
            badges,
        })
    }

    /// Append any badges the user now qualifies for. Runs last in the
    /// award path; appends are idempotent per (user, badge).
    async fn evaluate_badges(
        &self,
        tx: &mut dyn StoreTx,
        worker_id: Uuid,
        streak: i64,
    ) -> CoreResult<Vec<String>> {
        let completed = tx.completed_task_count(worker_id).await?;
        let earned = tx.net_earned_total(worker_id).await?;

        let candidates: [(&str, i16, bool); 6] = [
            ("first_gig", 1, completed >= 1),
            ("ten_gigs", 2, completed >= 10),
            ("fifty_gigs", 3, completed >= 50),
            ("streak_week", 2, streak >= 7),
            ("big_earner", 2, earned >= 100_000),
            ("heavy_hitter", 3, earned >= 1_000_000),
        ];

        let mut appended = Vec::new();
        let now = Utc::now();
        for (badge_id, tier, qualifies) in candidates {
            if !qualifies {
                continue;
            }
            let award = BadgeAward {
                id: Uuid::new_v4(),
                user_id: worker_id,
                badge_id: badge_id.to_string(),
                tier,
                awarded_at: now,
            };
            if tx.append_badge(&award).await? {
                appended.push(badge_id.to_string());
            }
        }
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MoneyStateLock, TaskStatus};
    use crate::store::{EscrowStore, MemoryStore};
    use crate::models::MoneyState;

    #[test]
    fn decay_drops_with_velocity_and_clamps_at_floor() {
        let ledger = RewardLedger::new(RewardConfig::default());
        assert_eq!(ledger.decay_factor(0), 1.0);
        assert!((ledger.decay_factor(2) - 0.7).abs() < 1e-9);
        assert_eq!(ledger.decay_factor(10), 0.2);
        assert_eq!(ledger.decay_factor(100), 0.2);
    }

    #[test]
    fn streak_multiplier_stays_inside_bounds() {
        let ledger = RewardLedger::new(RewardConfig::default());
        assert_eq!(ledger.streak_multiplier(1), 1.0);
        assert!((ledger.streak_multiplier(4) - 1.3).abs() < 1e-9);
        assert_eq!(ledger.streak_multiplier(11), 2.0);
        assert_eq!(ledger.streak_multiplier(365), 2.0);
    }

    #[test]
    fn streak_counts_back_from_yesterday_and_breaks_on_gaps() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 10).unwrap();
        let day = |d: u32| NaiveDate::from_ymd_opt(2025, 6, d).unwrap();

        assert_eq!(current_streak(&[], today), 1);
        assert_eq!(current_streak(&[day(9), day(8), day(7)], today), 4);
        // Gap on the 8th stops the walk
        assert_eq!(current_streak(&[day(9), day(7), day(6)], today), 2);
        // An earlier award today does not double count
        assert_eq!(current_streak(&[day(10), day(9)], today), 2);
    }

    #[test]
    fn levels_and_tiers_are_monotone() {
        assert_eq!(level_for(0), 1);
        assert_eq!(level_for(99), 1);
        assert_eq!(level_for(100), 2);
        assert_eq!(level_for(1_000), 5);
        assert_eq!(level_for(1_000_000), 10);

        assert_eq!(tier_for(1), 1);
        assert_eq!(tier_for(3), 2);
        assert_eq!(tier_for(5), 3);
        assert_eq!(tier_for(9), 5);

        let mut last = 0;
        for total in [0, 50, 100, 250, 500, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000] {
            let level = level_for(total);
            assert!(level >= last, "level must never decrease");
            last = level;
        }
    }

    #[test]
    fn base_amount_scales_with_price_tier() {
        assert_eq!(base_amount(TaskCategory::Errand, 1_000), 50);
        assert_eq!(base_amount(TaskCategory::Errand, 10_000), 75);
        assert_eq!(base_amount(TaskCategory::Moving, 150_000), 300);
    }

    async fn seed_released_task(store: &MemoryStore, worker: Uuid) -> (Task, EscrowHold) {
        let mut task = Task::new(Uuid::new_v4(), TaskCategory::Cleaning, 10_000);
        task.status = TaskStatus::Completed;
        task.assigned_worker_id = Some(worker);
        let hold = EscrowHold::new(
            task.id,
            task.poster_id,
            worker,
            10_000,
            1_200,
            "pi_test".to_string(),
        );
        let mut lock = MoneyStateLock::held(task.id, "pi_test".to_string());
        lock.advance(MoneyState::Released).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_task(&task).await.unwrap();
        tx.insert_escrow_hold(&hold).await.unwrap();
        tx.insert_money_lock(&lock).await.unwrap();
        tx.commit().await.unwrap();
        (task, hold)
    }

    #[tokio::test]
    async fn awarding_twice_applies_once() {
        let store = MemoryStore::new();
        let worker = Uuid::new_v4();
        let (task, hold) = seed_released_task(&store, worker).await;
        let ledger = RewardLedger::new(RewardConfig::default());

        let mut tx = store.begin().await.unwrap();
        let first = ledger.award_for_task(&mut *tx, &task, worker, &hold).await.unwrap();
        assert!(!first.already_awarded);
        // Fresh streak, no recent awards: base 80 * 1.5 price tier = 120
        assert_eq!(first.applied, 120);
        assert_eq!(first.badges, vec!["first_gig".to_string()]);

        let second = ledger.award_for_task(&mut *tx, &task, worker, &hold).await.unwrap();
        assert!(second.already_awarded);
        assert_eq!(second.applied, 0);
        assert!(second.entry.is_none());

        assert_eq!(tx.xp_total(worker).await.unwrap(), 120);
    }

    #[tokio::test]
    async fn tier_crossing_appends_to_the_trust_ledger() {
        let store = MemoryStore::new();
        let worker = Uuid::new_v4();
        let ledger = RewardLedger::new(RewardConfig::default());

        // Pre-load enough points to sit just under level 3 (tier 2)
        let mut tx = store.begin().await.unwrap();
        tx.insert_xp_entry(&XpEntry {
            id: Uuid::new_v4(),
            user_id: worker,
            task_id: Uuid::new_v4(),
            base_amount: 240,
            decay_factor: 1.0,
            streak_multiplier: 1.0,
            final_amount: 240,
            awarded_at: Utc::now() - Duration::days(30),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let (task, hold) = seed_released_task(&store, worker).await;
        let mut tx = store.begin().await.unwrap();
        let result = ledger.award_for_task(&mut *tx, &task, worker, &hold).await.unwrap();

        assert!(result.applied > 10); // 240 + award crosses the 250 line
        assert_eq!(result.old_tier, 1);
        assert_eq!(result.new_tier, 2);
        assert_eq!(tx.current_tier(worker).await.unwrap(), 2);
    }
}
