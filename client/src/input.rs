//! Movement intent for a headless peer
//!
//! Input devices are outside this crate. Anything that can produce a
//! planar intent each frame implements [`IntentSource`]; the binary uses a
//! [`ScriptedIntent`] so a peer can be run without a window.

use clap::ValueEnum;
use shared::Vec2;

/// Produces one movement intent per simulation step.
pub trait IntentSource {
    fn sample(&mut self, delta_time: f32) -> Vec2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MovementPattern {
    /// Never moves
    Idle,
    /// Back and forth along x
    Line,
    /// Walks in a circle
    Circle,
}

/// Seconds spent walking one way in [`MovementPattern::Line`].
const LINE_LEG_SECS: f32 = 2.0;
/// Radians per second in [`MovementPattern::Circle`].
const CIRCLE_RATE: f32 = 1.0;

pub struct ScriptedIntent {
    pattern: MovementPattern,
    elapsed: f32,
}

impl ScriptedIntent {
    pub fn new(pattern: MovementPattern) -> Self {
        Self {
            pattern,
            elapsed: 0.0,
        }
    }

    pub fn pattern(&self) -> MovementPattern {
        self.pattern
    }
}

impl IntentSource for ScriptedIntent {
    fn sample(&mut self, delta_time: f32) -> Vec2 {
        let t = self.elapsed;
        self.elapsed += delta_time;

        match self.pattern {
            MovementPattern::Idle => Vec2::ZERO,
            MovementPattern::Line => {
                let leg = (t / LINE_LEG_SECS) as u32;
                if leg % 2 == 0 {
                    Vec2::new(1.0, 0.0)
                } else {
                    Vec2::new(-1.0, 0.0)
                }
            }
            MovementPattern::Circle => {
                let angle = t * CIRCLE_RATE;
                Vec2::new(angle.cos(), angle.sin())
            }
        }
    }
}
