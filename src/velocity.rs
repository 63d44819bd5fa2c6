//! Chart velocity between two consecutive positions of the same series.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Stable,
}

/// Derived from a pair of chart positions; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VelocityMetric {
    /// `previous - current`, positive when the rank improved.
    pub movement: i64,
    pub new_entry: bool,
    pub velocity_score: i64,
    /// Absent for new entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

/// Computes the velocity of a chart position relative to the immediately
/// preceding observation. `previous` is `None` when the entity had no prior
/// position on that chart.
pub fn velocity(current: i64, previous: Option<i64>) -> VelocityMetric {
    let Some(previous) = previous else {
        return VelocityMetric {
            movement: 0,
            new_entry: true,
            velocity_score: 0,
            direction: None,
        };
    };

    let movement = previous.saturating_sub(current);
    let direction = match movement {
        m if m > 0 => Direction::Up,
        m if m < 0 => Direction::Down,
        _ => Direction::Stable,
    };
    let velocity_score = movement
        .saturating_abs()
        .saturating_mul(100i64.saturating_sub(current))
        .max(0);

    VelocityMetric {
        movement,
        new_entry: false,
        velocity_score,
        direction: Some(direction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_climb_into_top_ten() {
        let v = velocity(5, Some(12));
        assert_eq!(v.movement, 7);
        assert!(!v.new_entry);
        assert_eq!(v.velocity_score, 665);
        assert_eq!(v.direction, Some(Direction::Up));
    }

    #[test]
    fn test_new_entry_has_no_direction() {
        let v = velocity(50, None);
        assert_eq!(
            v,
            VelocityMetric {
                movement: 0,
                new_entry: true,
                velocity_score: 0,
                direction: None,
            }
        );
        assert_eq!(
            serde_json::to_value(v).unwrap(),
            json!({"movement": 0, "new_entry": true, "velocity_score": 0})
        );
    }

    #[test]
    fn test_unchanged_position_is_stable() {
        let v = velocity(10, Some(10));
        assert_eq!(v.movement, 0);
        assert_eq!(v.direction, Some(Direction::Stable));
        assert_eq!(v.velocity_score, 0);
    }

    #[test]
    fn test_drop_scores_by_magnitude() {
        let v = velocity(30, Some(20));
        assert_eq!(v.movement, -10);
        assert_eq!(v.direction, Some(Direction::Down));
        assert_eq!(v.velocity_score, 700);
        assert_eq!(serde_json::to_value(v).unwrap()["direction"], "down");
    }

    #[test]
    fn test_score_clamped_below_rank_hundred() {
        let v = velocity(150, Some(120));
        assert_eq!(v.movement, -30);
        assert_eq!(v.velocity_score, 0);
    }
}
