//! Software bed leveling
//!
//! A [`LevelingTransform`] rewrites outgoing lines to compensate for a bed
//! that is not square to the gantry. A transform may expand one line into
//! several; the engine frames the first and queues the rest behind it.

use super::transforms::is_move;
use crate::protocol::parse::{first_number_after, format_number, replace_number_after};
use printlink_core::{MovementMode, Position};

/// Rewrites lines for a measured bed
pub trait LevelingTransform: Send + Sync {
    /// Short identifier for logs
    fn name(&self) -> &str;

    /// Rewrite `line`
    ///
    /// # Arguments
    /// * `line` - Upper-case line about to be sent
    /// * `destination` - Commanded destination after this line
    /// * `mode` - Coordinate mode in force
    ///
    /// # Returns
    /// The lines to send in its place, never empty.
    fn apply(&self, line: &str, destination: Position, mode: MovementMode) -> Vec<String>;
}

/// Leveling against a plane through three probed points
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneLeveling {
    origin: Position,
    normal: Position,
}

impl PlaneLeveling {
    /// Plane through three probe results. `None` when the points are collinear.
    pub fn from_points(points: [Position; 3]) -> Option<Self> {
        let [a, b, c] = points;
        let u = Position::new(b.x - a.x, b.y - a.y, b.z - a.z);
        let v = Position::new(c.x - a.x, c.y - a.y, c.z - a.z);
        let normal = Position::new(
            u.y * v.z - u.z * v.y,
            u.z * v.x - u.x * v.z,
            u.x * v.y - u.y * v.x,
        );
        if normal.z.abs() < 1e-9 {
            return None;
        }
        Some(Self { origin: a, normal })
    }

    /// Bed height under `(x, y)`
    pub fn height_at(&self, x: f64, y: f64) -> f64 {
        let n = self.normal;
        self.origin.z - (n.x * (x - self.origin.x) + n.y * (y - self.origin.y)) / n.z
    }
}

impl LevelingTransform for PlaneLeveling {
    fn name(&self) -> &str {
        "plane"
    }

    fn apply(&self, line: &str, destination: Position, mode: MovementMode) -> Vec<String> {
        if line.starts_with("G28") {
            return vec![line.to_string(), "M114".to_string()];
        }

        let has_axis = ["X", "Y", "Z"]
            .iter()
            .any(|axis| first_number_after(axis, line).is_some());
        if !is_move(line) || !has_axis || mode != MovementMode::Absolute {
            return vec![line.to_string()];
        }

        let z = destination.z + self.height_at(destination.x, destination.y);
        let leveled = if first_number_after("Z", line).is_some() {
            replace_number_after('Z', line, z)
        } else {
            format!("{} Z{}", line, format_number(z))
        };
        vec![leveled]
    }
}
