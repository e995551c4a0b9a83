use crate::domain::models::ActionType;

pub const ADD_SITE_POINTS: i64 = 10;
pub const START_POINTS_PER_DAY: i64 = 50;
pub const COMPLETION_POINTS_PER_DAY: i64 = 100;
pub const DAILY_BONUS_POINTS: i64 = 10;
pub const PANIC_MODE_POINTS: i64 = 25;
pub const EMERGENCY_RESIST_POINTS: i64 = 25;
pub const EMERGENCY_DISABLE_PENALTY: i64 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointContext {
    pub duration_days: u32,
    pub days_completed: u32,
    pub bonus_days: u32,
}

pub fn base_points(action: ActionType, context: PointContext) -> i64 {
    match action {
        ActionType::AddSite => ADD_SITE_POINTS,
        ActionType::StartSession => context.duration_days as i64 * START_POINTS_PER_DAY,
        ActionType::CompleteSession => context.days_completed as i64 * COMPLETION_POINTS_PER_DAY,
        ActionType::DailyBonus => context.bonus_days as i64 * DAILY_BONUS_POINTS,
        ActionType::PanicMode => PANIC_MODE_POINTS,
        ActionType::EmergencyResist => EMERGENCY_RESIST_POINTS,
        // the disable penalty bypasses the award table entirely
        ActionType::EmergencyDisable => 0,
    }
}

// Multiplier in tenths so floor(base * multiplier) stays exact integer math.
pub fn multiplier_tenths(prior_occurrences: u64) -> i64 {
    if prior_occurrences < 10 {
        10
    } else if prior_occurrences < 50 {
        8
    } else if prior_occurrences < 100 {
        6
    } else {
        4
    }
}

pub fn award(action: ActionType, context: PointContext, prior_occurrences: u64) -> i64 {
    base_points(action, context) * multiplier_tenths(prior_occurrences) / 10
}
