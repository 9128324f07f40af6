//! Feedback weighting.
//!
//! Ratings from different users count for different amounts. A rating's
//! weight is the product of one factor per user dimension (role, past
//! accuracy, activity) and a time decay applied to late feedback.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Who gave the feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Expert,
    PowerUser,
    #[default]
    Regular,
    NewUser,
}

impl UserRole {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "expert" => Some(Self::Expert),
            "power_user" => Some(Self::PowerUser),
            "regular" => Some(Self::Regular),
            "new_user" => Some(Self::NewUser),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expert => "expert",
            Self::PowerUser => "power_user",
            Self::Regular => "regular",
            Self::NewUser => "new_user",
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How often the user's past feedback agreed with the eventual consensus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyLevel {
    /// 85% and above
    High,
    /// 60% to 85%
    Medium,
    Low,
}

impl AccuracyLevel {
    pub fn from_score(accuracy: f64) -> Self {
        if accuracy >= 0.85 {
            Self::High
        } else if accuracy >= 0.60 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    High,
    Medium,
    Low,
}

impl ActivityLevel {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// What is known about the user giving feedback; unknown dimensions are neutral
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub role: Option<UserRole>,
    pub accuracy: Option<AccuracyLevel>,
    pub activity: Option<ActivityLevel>,
}

impl UserContext {
    pub fn with_role(mut self, role: UserRole) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(AccuracyLevel::from_score(accuracy));
        self
    }

    pub fn with_activity(mut self, activity: ActivityLevel) -> Self {
        self.activity = Some(activity);
        self
    }
}

/// No decay for feedback given within this many minutes
const DECAY_GRACE_MINUTES: i64 = 30;
/// Minutes over which decay reaches its floor
const DECAY_SPAN_MINUTES: f64 = 360.0;
const DECAY_FLOOR: f64 = 0.5;

/// Computes rating weights
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackWeigher;

impl FeedbackWeigher {
    /// Product of the per-dimension factors.
    pub fn context_adjustment(&self, user: &UserContext) -> f64 {
        let role = match user.role {
            Some(UserRole::Expert) => 1.5,
            Some(UserRole::PowerUser) => 1.3,
            Some(UserRole::Regular) | None => 1.0,
            Some(UserRole::NewUser) => 0.8,
        };
        let accuracy = match user.accuracy {
            Some(AccuracyLevel::High) => 1.4,
            Some(AccuracyLevel::Medium) | None => 1.0,
            Some(AccuracyLevel::Low) => 0.7,
        };
        let activity = match user.activity {
            Some(ActivityLevel::High) => 1.2,
            Some(ActivityLevel::Medium) | None => 1.0,
            Some(ActivityLevel::Low) => 0.9,
        };
        role * accuracy * activity
    }

    /// Multiplier for feedback given `age` after the answer.
    ///
    /// 1.0 for the first 30 minutes, then linear down to 0.5 six hours later.
    pub fn time_decay(&self, age: Duration) -> f64 {
        let minutes = age.num_minutes();
        if minutes <= DECAY_GRACE_MINUTES {
            return 1.0;
        }
        let decay = 1.0 - ((minutes - DECAY_GRACE_MINUTES) as f64 / DECAY_SPAN_MINUTES).min(DECAY_FLOOR);
        decay.max(DECAY_FLOOR)
    }

    pub fn weight(&self, user: &UserContext, age: Duration) -> f64 {
        self.context_adjustment(user) * self.time_decay(age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_context_adjustment_multiplies_dimensions() {
        let weigher = FeedbackWeigher;
        assert!(close(weigher.context_adjustment(&UserContext::default()), 1.0));

        let expert = UserContext::default()
            .with_role(UserRole::Expert)
            .with_accuracy(0.9)
            .with_activity(ActivityLevel::High);
        assert!(close(weigher.context_adjustment(&expert), 1.5 * 1.4 * 1.2));

        let newcomer = UserContext::default()
            .with_role(UserRole::NewUser)
            .with_accuracy(0.3);
        assert!(close(weigher.context_adjustment(&newcomer), 0.8 * 0.7));
    }

    #[test]
    fn test_accuracy_levels() {
        assert_eq!(AccuracyLevel::from_score(0.85), AccuracyLevel::High);
        assert_eq!(AccuracyLevel::from_score(0.84), AccuracyLevel::Medium);
        assert_eq!(AccuracyLevel::from_score(0.60), AccuracyLevel::Medium);
        assert_eq!(AccuracyLevel::from_score(0.59), AccuracyLevel::Low);
    }

    #[test]
    fn test_time_decay() {
        let weigher = FeedbackWeigher;
        assert!(close(weigher.time_decay(Duration::minutes(0)), 1.0));
        assert!(close(weigher.time_decay(Duration::minutes(30)), 1.0));
        assert!(close(weigher.time_decay(Duration::minutes(210)), 0.5));
        assert!(close(weigher.time_decay(Duration::minutes(120)), 0.75));
        assert!(close(weigher.time_decay(Duration::days(3)), 0.5));
    }

    #[test]
    fn test_role_round_trip() {
        for role in [UserRole::Expert, UserRole::PowerUser, UserRole::Regular, UserRole::NewUser] {
            assert_eq!(UserRole::from_str(role.as_str()), Some(role));
        }
        assert_eq!(UserRole::from_str("admin"), None);
    }
}
