//! Client-side prediction and server reconciliation for one owned entity.
//!
//! The owning peer runs a [`PredictedMover`]: every non-idle input is applied
//! locally straight away, stamped with the next tick and kept in a pending
//! buffer until the authority acknowledges it. The authority runs an
//! [`AuthoritativeMover`] for the same entity, applies each received input
//! with the input's own delta time and answers with a [`Correction`].
//!
//! On a correction the peer snaps to the authoritative position, forgets
//! every input up to the acknowledged tick and replays the rest. Both sides
//! move through [`crate::apply_movement`], which keeps them in lockstep.

use crate::{apply_movement, is_negligible, Packet, Tick, Vec2, Vec3, MOVE_SPEED};
use log::{debug, warn};
use std::collections::VecDeque;

/// Default bound on unacknowledged inputs (about four seconds at 60Hz).
pub const DEFAULT_MAX_PENDING: usize = 256;

/// One unit of movement input, as buffered by the peer and sent to the authority.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictedInput {
    pub intent: Vec2,
    pub delta_time: f32,
    pub tick: Tick,
}

impl PredictedInput {
    pub fn to_packet(&self) -> Packet {
        Packet::MovementInput {
            intent: self.intent,
            delta_time: self.delta_time,
            tick: self.tick,
        }
    }
}

/// Authoritative answer to one processed input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correction {
    pub authoritative_position: Vec3,
    pub acknowledged_tick: Tick,
}

impl From<Correction> for Packet {
    fn from(correction: Correction) -> Self {
        Packet::MovementCorrection {
            authoritative_position: correction.authoritative_position,
            acknowledged_tick: correction.acknowledged_tick,
        }
    }
}

/// What the peer does once `max_pending` inputs are waiting for acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest unacknowledged input and keep predicting.
    DropOldest,
    /// Stop predicting (and sending) until an acknowledgement frees room.
    Freeze,
}

/// How a correction is presented locally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionMode {
    /// Jump straight to the reconciled position.
    Snap,
    /// Reconcile immediately but fade the visible error out, removing
    /// `blend` of the remaining offset on every simulation step.
    Smooth { blend: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionConfig {
    pub move_speed: f32,
    pub max_pending: usize,
    pub overflow: OverflowPolicy,
    pub correction: CorrectionMode,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            move_speed: MOVE_SPEED,
            max_pending: DEFAULT_MAX_PENDING,
            overflow: OverflowPolicy::Freeze,
            correction: CorrectionMode::Snap,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionOutcome {
    /// Position reconciled; `replayed` inputs were re-applied on top.
    Applied { replayed: usize, error: f32 },
    /// Older than what has already been acknowledged; ignored.
    Stale { acknowledged_tick: Tick },
    /// Acknowledges a tick this mover never issued (e.g. from before a reset).
    Foreign { tick: Tick },
}

/// Peer-side half of the engine.
#[derive(Debug, Clone)]
pub struct PredictedMover {
    position: Vec3,
    visual_offset: Vec3,
    pending: VecDeque<PredictedInput>,
    last_tick: Tick,
    acknowledged_tick: Tick,
    config: PredictionConfig,
}

impl PredictedMover {
    pub fn new(position: Vec3, config: PredictionConfig) -> Self {
        Self {
            position,
            visual_offset: Vec3::ZERO,
            pending: VecDeque::new(),
            last_tick: 0,
            acknowledged_tick: 0,
            config,
        }
    }

    /// Starts over at `position`, as after the authority (re)assigns the entity.
    pub fn reset(&mut self, position: Vec3, move_speed: f32) {
        self.position = position;
        self.visual_offset = Vec3::ZERO;
        self.pending.clear();
        self.last_tick = 0;
        self.acknowledged_tick = 0;
        self.config.move_speed = move_speed;
    }

    /// Runs one simulation step on the owning peer.
    ///
    /// Returns the input to transmit, or `None` when nothing was consumed
    /// (idle intent, or frozen by a full buffer).
    pub fn step(&mut self, intent: Vec2, delta_time: f32) -> Option<PredictedInput> {
        self.decay_visual_offset();

        if is_negligible(intent) || !intent.is_finite() || !delta_time.is_finite() {
            return None;
        }

        if self.pending.len() >= self.config.max_pending {
            match self.config.overflow {
                OverflowPolicy::Freeze => {
                    debug!(
                        "Prediction frozen: {} inputs unacknowledged since tick {}",
                        self.pending.len(),
                        self.acknowledged_tick
                    );
                    return None;
                }
                OverflowPolicy::DropOldest => {
                    if let Some(dropped) = self.pending.pop_front() {
                        warn!("Pending input buffer full, dropping tick {}", dropped.tick);
                    }
                }
            }
        }

        apply_movement(&mut self.position, intent, self.config.move_speed, delta_time);

        self.last_tick += 1;
        let input = PredictedInput {
            intent,
            delta_time,
            tick: self.last_tick,
        };
        self.pending.push_back(input);

        Some(input)
    }

    /// Reconciles against an authoritative position.
    pub fn apply_correction(&mut self, correction: Correction) -> CorrectionOutcome {
        let tick = correction.acknowledged_tick;

        if tick < self.acknowledged_tick {
            debug!(
                "Ignoring stale correction for tick {} (acknowledged {})",
                tick, self.acknowledged_tick
            );
            return CorrectionOutcome::Stale {
                acknowledged_tick: self.acknowledged_tick,
            };
        }
        if tick > self.last_tick {
            warn!(
                "Correction acknowledges tick {} but only {} were issued",
                tick, self.last_tick
            );
            return CorrectionOutcome::Foreign { tick };
        }

        let shown_before = self.display_position();
        self.acknowledged_tick = tick;

        while self.pending.front().is_some_and(|input| input.tick <= tick) {
            self.pending.pop_front();
        }

        self.position = correction.authoritative_position;
        for input in &self.pending {
            apply_movement(
                &mut self.position,
                input.intent,
                self.config.move_speed,
                input.delta_time,
            );
        }

        let error = shown_before.distance(self.position);
        self.visual_offset = match self.config.correction {
            CorrectionMode::Snap => Vec3::ZERO,
            CorrectionMode::Smooth { .. } => shown_before - self.position,
        };

        if error > 0.01 {
            debug!(
                "Reconciled at tick {}: error {:.3}, replayed {}",
                tick,
                error,
                self.pending.len()
            );
        }

        CorrectionOutcome::Applied {
            replayed: self.pending.len(),
            error,
        }
    }

    fn decay_visual_offset(&mut self) {
        if let CorrectionMode::Smooth { blend } = self.config.correction {
            self.visual_offset = self.visual_offset * (1.0 - blend.clamp(0.0, 1.0));
            if self.visual_offset.length() < 1e-4 {
                self.visual_offset = Vec3::ZERO;
            }
        }
    }

    /// Reconciled position; what the simulation believes.
    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Position to present; differs from [`Self::position`] only while a
    /// smoothed correction is fading out.
    pub fn display_position(&self) -> Vec3 {
        self.position + self.visual_offset
    }

    pub fn acknowledged_tick(&self) -> Tick {
        self.acknowledged_tick
    }

    pub fn last_tick(&self) -> Tick {
        self.last_tick
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = &PredictedInput> {
        self.pending.iter()
    }

    pub fn is_frozen(&self) -> bool {
        self.config.overflow == OverflowPolicy::Freeze
            && self.pending.len() >= self.config.max_pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputRejection {
    /// Tick not newer than the last one processed.
    Duplicate { tick: Tick, last_processed: Tick },
    NonFinite,
}

/// Authority-side half of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthoritativeMover {
    position: Vec3,
    move_speed: f32,
    last_processed_tick: Tick,
}

impl AuthoritativeMover {
    pub fn new(position: Vec3, move_speed: f32) -> Self {
        Self {
            position,
            move_speed,
            last_processed_tick: 0,
        }
    }

    /// Applies one received input using its own delta time.
    pub fn apply(&mut self, input: &PredictedInput) -> Result<Correction, InputRejection> {
        if !input.intent.is_finite() || !input.delta_time.is_finite() {
            return Err(InputRejection::NonFinite);
        }
        if input.tick <= self.last_processed_tick {
            return Err(InputRejection::Duplicate {
                tick: input.tick,
                last_processed: self.last_processed_tick,
            });
        }

        apply_movement(
            &mut self.position,
            input.intent,
            self.move_speed,
            input.delta_time,
        );
        self.last_processed_tick = input.tick;

        Ok(Correction {
            authoritative_position: self.position,
            acknowledged_tick: input.tick,
        })
    }

    /// Forgets the processed-tick watermark; a newly owning peer numbers from 1.
    pub fn restart_sequence(&mut self) {
        self.last_processed_tick = 0;
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn move_speed(&self) -> f32 {
        self.move_speed
    }

    pub fn last_processed_tick(&self) -> Tick {
        self.last_processed_tick
    }
}
