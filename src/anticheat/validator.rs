#[cfg(feature = "anticheat")]
use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "anticheat")]
use parking_lot::Mutex;

use crate::game::constants::anticheat::{
    MAX_PLAYER_SPEED, REACH_TOLERANCE, SPEED_TOLERANCE, TELEPORT_DISTANCE,
};
use crate::game::state::PeerId;
use crate::util::vec3::Vec3;

/// Violations detected by action validation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CheatViolation {
    #[error("NaN or Infinity in reported values")]
    InvalidFloats,
    #[error("Movement rejected")]
    MovementRejected,
    #[error("Damage rejected: claimed {0}")]
    DamageRejected(f32),
    #[error("Out of range: {distance:.1} > {max:.1}")]
    OutOfRange { distance: f32, max: f32 },
    #[error("Message rate exceeded: {0} messages this second")]
    RateExceeded(u32),
}

/// Interaction being checked by [`ActionValidator::validate_action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Pickup,
    Inspect,
    Extract,
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActionContext {
    pub kind: ActionKind,
    /// Distance between the player and the interaction target
    pub distance: f32,
    /// Largest distance the action allows
    pub max_distance: f32,
}

/// Validation capability consulted by the sync managers before applying
/// client-reported changes.
pub trait ActionValidator: Send + Sync {
    /// Check a reported position given `dt` seconds since the previous report
    fn validate_position(&self, peer_id: PeerId, position: Vec3, dt: f32) -> bool;

    /// Check a claimed hit against the weapon's damage and range
    fn validate_damage(
        &self,
        peer_id: PeerId,
        claimed: f32,
        weapon_damage: f32,
        distance: f32,
        weapon_range: f32,
    ) -> bool;

    fn validate_action(&self, peer_id: PeerId, action: &ActionContext) -> Result<(), CheatViolation>;

    /// Server moved the player (spawn, respawn, scene change)
    fn reset_position(&self, _peer_id: PeerId, _position: Vec3) {}

    /// Peer left; drop any per-peer state
    fn forget(&self, _peer_id: PeerId) {}

    fn name(&self) -> &'static str;
}

/// Accepts everything
#[derive(Debug, Default)]
pub struct PermissiveValidator;

impl ActionValidator for PermissiveValidator {
    fn validate_position(&self, _peer_id: PeerId, _position: Vec3, _dt: f32) -> bool {
        true
    }

    fn validate_damage(&self, _: PeerId, _: f32, _: f32, _: f32, _: f32) -> bool {
        true
    }

    fn validate_action(&self, _: PeerId, _: &ActionContext) -> Result<(), CheatViolation> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "permissive"
    }
}

/// Thresholds for the rule-based validator
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Maximum horizontal speed (units/second)
    pub max_speed: f32,
    /// Multiplier applied to `max_speed` for latency slack
    pub speed_tolerance: f32,
    /// Any single jump beyond this is a teleport
    pub teleport_distance: f32,
    /// Added to every reach limit
    pub reach_tolerance: f32,
    /// Floor for `dt` so back-to-back reports are not divided by ~0
    pub min_dt: f32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_speed: MAX_PLAYER_SPEED,
            speed_tolerance: SPEED_TOLERANCE,
            teleport_distance: TELEPORT_DISTANCE,
            reach_tolerance: REACH_TOLERANCE,
            min_dt: 0.05,
        }
    }
}

/// Movement, damage and reach checks against fixed thresholds
#[cfg(feature = "anticheat")]
pub struct RuleValidator {
    config: ValidationConfig,
    last_positions: Mutex<HashMap<PeerId, Vec3>>,
}

#[cfg(feature = "anticheat")]
impl RuleValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            last_positions: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(feature = "anticheat")]
impl ActionValidator for RuleValidator {
    fn validate_position(&self, peer_id: PeerId, position: Vec3, dt: f32) -> bool {
        if !position.is_finite() || !dt.is_finite() {
            return false;
        }

        let mut last_positions = self.last_positions.lock();
        let Some(&previous) = last_positions.get(&peer_id) else {
            last_positions.insert(peer_id, position);
            return true;
        };

        let distance = previous.distance_flat(position);
        if distance > self.config.teleport_distance {
            return false;
        }

        let allowed = self.config.max_speed * self.config.speed_tolerance * dt.max(self.config.min_dt);
        if distance > allowed {
            return false;
        }

        last_positions.insert(peer_id, position);
        true
    }

    fn validate_damage(
        &self,
        _peer_id: PeerId,
        claimed: f32,
        weapon_damage: f32,
        distance: f32,
        weapon_range: f32,
    ) -> bool {
        claimed.is_finite()
            && distance.is_finite()
            && claimed > 0.0
            // Slight tolerance for float precision
            && claimed <= weapon_damage * 1.001
            && distance <= weapon_range + self.config.reach_tolerance
    }

    fn validate_action(&self, _peer_id: PeerId, action: &ActionContext) -> Result<(), CheatViolation> {
        if !action.distance.is_finite() {
            return Err(CheatViolation::InvalidFloats);
        }
        let max = action.max_distance + self.config.reach_tolerance;
        if action.distance > max {
            return Err(CheatViolation::OutOfRange {
                distance: action.distance,
                max,
            });
        }
        Ok(())
    }

    fn reset_position(&self, peer_id: PeerId, position: Vec3) {
        self.last_positions.lock().insert(peer_id, position);
    }

    fn forget(&self, peer_id: PeerId) {
        self.last_positions.lock().remove(&peer_id);
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}

/// Pick the validator for this build and configuration
pub fn select_validator(enabled: bool) -> Arc<dyn ActionValidator> {
    #[cfg(feature = "anticheat")]
    if enabled {
        tracing::info!("Anti-cheat: rule-based validation enabled");
        return Arc::new(RuleValidator::new(ValidationConfig::default()));
    }

    if enabled {
        tracing::warn!("Anti-cheat requested but not compiled in; using permissive validator");
    } else {
        tracing::info!("Anti-cheat disabled; using permissive validator");
    }
    Arc::new(PermissiveValidator)
}
