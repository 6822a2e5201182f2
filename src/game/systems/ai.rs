//! Server-side AI behavior controller
//!
//! One controller per AI entity. A controller is a pure simulation unit: it is
//! advanced by the registry with the elapsed time and the nearest living
//! player, and reports what happened through a queue of [`AiEvent`]s that the
//! registry drains after every pass. It never touches the network.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::game::constants::ai::*;
use crate::game::state::{AiId, PeerId};
use crate::util::vec3::Vec3;

/// Behavior state of an AI entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AiState {
    Idle,
    Patrol,
    Alert,
    Chase,
    Attack,
    Cover,
    Flee,
    Stunned,
    /// Terminal: no outgoing transitions
    Dead,
}

/// Coarse strength tier of an AI type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AiCategory {
    #[default]
    Normal,
    Elite,
    Boss,
}

/// AI personality; modulates transitions, not a separate state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BehaviorType {
    /// Flees when badly hurt
    Passive,
    #[default]
    Defensive,
    /// Always resumes the chase after cover
    Aggressive,
    /// Never retreats to cover
    Boss,
}

/// Combat and movement stats of an AI entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiStats {
    pub detect_range: f32,
    pub attack_range: f32,
    pub move_speed: f32,
    pub attack_damage: f32,
    /// Seconds between attacks
    pub attack_cooldown: f32,
    pub max_health: f32,
}

impl Default for AiStats {
    fn default() -> Self {
        Self {
            detect_range: DEFAULT_DETECT_RANGE,
            attack_range: DEFAULT_ATTACK_RANGE,
            move_speed: DEFAULT_MOVE_SPEED,
            attack_damage: DEFAULT_ATTACK_DAMAGE,
            attack_cooldown: DEFAULT_ATTACK_COOLDOWN,
            max_health: DEFAULT_MAX_HEALTH,
        }
    }
}

/// Nearest living player as seen by one AI
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Perception {
    pub peer_id: PeerId,
    pub position: Vec3,
}

/// Observable side effects of a controller
#[derive(Debug, Clone, PartialEq)]
pub enum AiEvent {
    StateChanged {
        ai_id: AiId,
        from: AiState,
        to: AiState,
    },
    Attack {
        ai_id: AiId,
        target: PeerId,
        damage: f32,
    },
    Died {
        ai_id: AiId,
        killer: Option<PeerId>,
    },
}

/// Finite-state machine driving one AI entity
#[derive(Debug, Clone)]
pub struct AiController {
    id: AiId,
    behavior: BehaviorType,
    stats: AiStats,
    state: AiState,
    position: Vec3,
    forward: Vec3,
    health: f32,
    patrol_path: Vec<Vec3>,
    waypoint: usize,
    target: Option<PeerId>,
    last_known: Option<Vec3>,
    /// Time spent in the current state
    state_time: f32,
    /// Randomized idle dwell chosen on entering Idle
    idle_dwell: f32,
    /// Time since a player was last detected
    unseen_time: f32,
    attack_cooldown: f32,
    rng: StdRng,
    events: Vec<AiEvent>,
}

impl AiController {
    /// Create a controller. Starts patrolling when a path exists, idle otherwise.
    pub fn new(
        id: AiId,
        behavior: BehaviorType,
        stats: AiStats,
        position: Vec3,
        patrol_path: Vec<Vec3>,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(id);
        let idle_dwell = rng.gen_range(IDLE_DWELL_MIN..=IDLE_DWELL_MAX);
        let state = if patrol_path.is_empty() {
            AiState::Idle
        } else {
            AiState::Patrol
        };

        Self {
            id,
            behavior,
            health: stats.max_health,
            stats,
            state,
            position,
            forward: Vec3::FORWARD,
            patrol_path,
            waypoint: 0,
            target: None,
            last_known: None,
            state_time: 0.0,
            idle_dwell,
            unseen_time: 0.0,
            attack_cooldown: 0.0,
            rng,
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> AiId {
        self.id
    }

    pub fn state(&self) -> AiState {
        self.state
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn forward(&self) -> Vec3 {
        self.forward
    }

    pub fn health(&self) -> f32 {
        self.health
    }

    pub fn max_health(&self) -> f32 {
        self.stats.max_health
    }

    pub fn stats(&self) -> &AiStats {
        &self.stats
    }

    pub fn target(&self) -> Option<PeerId> {
        self.target
    }

    pub fn is_dead(&self) -> bool {
        self.state == AiState::Dead
    }

    /// Drain events produced since the last call, in production order
    pub fn take_events(&mut self) -> Vec<AiEvent> {
        std::mem::take(&mut self.events)
    }

    /// Advance the state machine by `dt` seconds.
    pub fn update(&mut self, dt: f32, nearest: Option<Perception>) {
        if self.state == AiState::Dead {
            return;
        }

        self.state_time += dt;
        self.attack_cooldown = (self.attack_cooldown - dt).max(0.0);

        let sighting = nearest.map(|p| (p, self.position.distance_flat(p.position)));
        let detected = sighting.filter(|(_, d)| *d <= self.stats.detect_range);

        match self.state {
            AiState::Idle => self.update_idle(detected),
            AiState::Patrol => self.update_patrol(dt, detected),
            AiState::Alert => self.update_alert(dt, detected),
            AiState::Chase => self.update_chase(dt, detected),
            AiState::Attack => self.update_attack(sighting),
            AiState::Cover => self.update_cover(dt, detected),
            AiState::Flee => self.update_flee(dt, sighting),
            AiState::Stunned => {
                if self.state_time >= STUN_SECONDS {
                    self.transition(AiState::Alert);
                }
            }
            AiState::Dead => {}
        }
    }

    /// Apply damage. Returns true if this hit killed the entity.
    pub fn apply_damage(&mut self, amount: f32, attacker: Option<PeerId>) -> bool {
        // Also rejects NaN
        if self.state == AiState::Dead || !(amount > 0.0) {
            return false;
        }

        self.health -= amount;

        if self.health <= 0.0 {
            self.health = 0.0;
            self.transition(AiState::Dead);
            self.events.push(AiEvent::Died {
                ai_id: self.id,
                killer: attacker,
            });
            return true;
        }

        if matches!(self.state, AiState::Idle | AiState::Patrol) {
            if attacker.is_some() {
                self.target = attacker;
            }
            self.transition(AiState::Alert);
        }

        if self.behavior == BehaviorType::Passive
            && self.health < self.stats.max_health * FLEE_HEALTH_FRACTION
        {
            self.transition(AiState::Flee);
        }

        false
    }

    /// Stun for the fixed stun duration; ignored once dead.
    pub fn stun(&mut self) {
        if self.state != AiState::Dead {
            self.transition(AiState::Stunned);
            // Re-stun restarts the clock
            self.state_time = 0.0;
        }
    }

    fn update_idle(&mut self, detected: Option<(Perception, f32)>) {
        if let Some((player, _)) = detected {
            self.acquire(player);
            self.transition(AiState::Alert);
            return;
        }

        if self.state_time >= self.idle_dwell && !self.patrol_path.is_empty() {
            self.transition(AiState::Patrol);
        }
    }

    fn update_patrol(&mut self, dt: f32, detected: Option<(Perception, f32)>) {
        if let Some((player, _)) = detected {
            self.acquire(player);
            self.transition(AiState::Alert);
            return;
        }

        let Some(&waypoint) = self.patrol_path.get(self.waypoint) else {
            self.transition(AiState::Idle);
            return;
        };

        self.move_toward(waypoint, dt);

        if self.position.distance_flat(waypoint) <= WAYPOINT_ARRIVAL {
            self.waypoint = (self.waypoint + 1) % self.patrol_path.len();
            if self.rng.gen_bool(PATROL_IDLE_CHANCE) {
                self.transition(AiState::Idle);
            }
        }
    }

    fn update_alert(&mut self, dt: f32, detected: Option<(Perception, f32)>) {
        match detected {
            Some((player, _)) => self.acquire(player),
            None => {
                self.unseen_time += dt;
                if self.unseen_time >= ALERT_FORGET_SECONDS {
                    self.forget();
                    self.transition(self.resting_state());
                    return;
                }
            }
        }

        if let Some(last_known) = self.last_known {
            self.face(last_known);
        }

        if self.state_time <= ALERT_COMMIT_SECONDS {
            return;
        }

        match detected {
            Some((_, distance)) if distance <= self.stats.attack_range => {
                self.transition(AiState::Attack)
            }
            Some(_) => self.transition(AiState::Chase),
            None if self.last_known.is_some() => self.transition(AiState::Chase),
            None => {}
        }
    }

    fn update_chase(&mut self, dt: f32, detected: Option<(Perception, f32)>) {
        if let Some((player, distance)) = detected {
            self.acquire(player);
            if distance <= self.stats.attack_range {
                self.transition(AiState::Attack);
            } else {
                self.move_toward(player.position, dt);
            }
            return;
        }

        self.unseen_time += dt;
        match self.last_known {
            Some(last_known) if self.position.distance_flat(last_known) > CHASE_LOST_DISTANCE => {
                self.move_toward(last_known, dt);
            }
            _ => {
                self.forget();
                self.transition(AiState::Alert);
            }
        }
    }

    fn update_attack(&mut self, sighting: Option<(Perception, f32)>) {
        let leash = self.stats.attack_range * ATTACK_LEASH_FACTOR;
        let (player, _) = match sighting {
            Some((player, distance)) if distance <= leash => (player, distance),
            _ => {
                self.transition(AiState::Chase);
                return;
            }
        };

        self.acquire(player);
        self.face(player.position);

        if self.attack_cooldown <= 0.0 {
            self.attack_cooldown = self.stats.attack_cooldown;
            self.events.push(AiEvent::Attack {
                ai_id: self.id,
                target: player.peer_id,
                damage: self.stats.attack_damage,
            });
        }

        if self.behavior != BehaviorType::Boss
            && self.health < self.stats.max_health * COVER_HEALTH_FRACTION
            && self.rng.gen_bool(COVER_CHANCE)
        {
            self.transition(AiState::Cover);
        }
    }

    fn update_cover(&mut self, dt: f32, detected: Option<(Perception, f32)>) {
        let max = self.stats.max_health;
        self.health = (self.health + max * COVER_REGEN_FRACTION_PER_SEC * dt).min(max);

        if self.state_time < COVER_HOLD_SECONDS {
            return;
        }

        if self.health > max * COVER_RECOVERED_FRACTION || self.behavior == BehaviorType::Aggressive
        {
            self.transition(AiState::Chase);
        } else if detected.is_none() {
            self.forget();
            self.transition(self.resting_state());
        } else {
            // Still threatened and still hurt: hold another round
            self.state_time = 0.0;
        }
    }

    fn update_flee(&mut self, dt: f32, sighting: Option<(Perception, f32)>) {
        let clear = self.stats.detect_range * FLEE_CLEAR_FACTOR;
        match sighting {
            Some((player, distance)) if distance <= clear => {
                let mut away = (self.position - player.position).flat().normalize();
                if away == Vec3::ZERO {
                    away = -self.forward;
                }
                let step = self.stats.move_speed * dt;
                self.move_toward(self.position + away * step, dt);
            }
            _ => {
                self.forget();
                self.transition(AiState::Idle);
            }
        }
    }

    fn acquire(&mut self, player: Perception) {
        self.target = Some(player.peer_id);
        self.last_known = Some(player.position);
        self.unseen_time = 0.0;
    }

    fn forget(&mut self) {
        self.target = None;
        self.last_known = None;
    }

    fn resting_state(&self) -> AiState {
        if self.patrol_path.is_empty() {
            AiState::Idle
        } else {
            AiState::Patrol
        }
    }

    fn transition(&mut self, to: AiState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        self.state_time = 0.0;

        match to {
            AiState::Idle => {
                self.idle_dwell = self.rng.gen_range(IDLE_DWELL_MIN..=IDLE_DWELL_MAX);
            }
            AiState::Alert => self.unseen_time = 0.0,
            _ => {}
        }

        self.events.push(AiEvent::StateChanged {
            ai_id: self.id,
            from,
            to,
        });
    }

    fn move_toward(&mut self, target: Vec3, dt: f32) {
        let goal = Vec3::new(target.x, self.position.y, target.z);
        let next = self.position.move_towards(goal, self.stats.move_speed * dt);
        let dir = (next - self.position).flat();
        if dir.length_sq() > f32::EPSILON {
            self.forward = dir.normalize();
        }
        self.position = next;
    }

    fn face(&mut self, target: Vec3) {
        let dir = (target - self.position).flat();
        if dir.length_sq() > f32::EPSILON {
            self.forward = dir.normalize();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAYER: PeerId = 42;

    fn stats() -> AiStats {
        AiStats {
            detect_range: 15.0,
            attack_range: 2.0,
            ..AiStats::default()
        }
    }

    fn controller(behavior: BehaviorType) -> AiController {
        AiController::new(1, behavior, stats(), Vec3::ZERO, Vec::new())
    }

    /// Player placed `distance` units along +X from the controller
    fn player_near(ai: &AiController, distance: f32) -> Option<Perception> {
        Some(Perception {
            peer_id: PLAYER,
            position: ai.position() + Vec3::new(distance, 0.0, 0.0),
        })
    }

    fn state_changes(events: &[AiEvent]) -> Vec<(AiState, AiState)> {
        events
            .iter()
            .filter_map(|e| match e {
                AiEvent::StateChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_initial_state_depends_on_patrol_path() {
        let idle = controller(BehaviorType::Defensive);
        assert_eq!(idle.state(), AiState::Idle);

        let patrol = AiController::new(
            2,
            BehaviorType::Defensive,
            stats(),
            Vec3::ZERO,
            vec![Vec3::new(10.0, 0.0, 0.0)],
        );
        assert_eq!(patrol.state(), AiState::Patrol);
    }

    #[test]
    fn test_detection_scenario_idle_alert_chase_attack() {
        let mut ai = controller(BehaviorType::Defensive);

        // Outside detect range: nothing happens
        let far = player_near(&ai, 20.0);
        ai.update(0.05, far);
        assert_eq!(ai.state(), AiState::Idle);

        // Crossing 15 triggers Alert within one tick
        let near = player_near(&ai, 10.0);
        ai.update(0.05, near);
        assert_eq!(ai.state(), AiState::Alert);
        assert_eq!(ai.target(), Some(PLAYER));

        // Alert commits to Chase after one second while the player is out of attack range
        for _ in 0..25 {
            let p = player_near(&ai, 10.0);
            ai.update(0.05, p);
        }
        assert_eq!(ai.state(), AiState::Chase);

        // Player closes to 1.5: Chase -> Attack
        let close = player_near(&ai, 1.5);
        ai.update(0.05, close);
        assert_eq!(ai.state(), AiState::Attack);

        let changes = state_changes(&ai.take_events());
        assert_eq!(
            changes,
            vec![
                (AiState::Idle, AiState::Alert),
                (AiState::Alert, AiState::Chase),
                (AiState::Chase, AiState::Attack),
            ]
        );
    }

    #[test]
    fn test_chase_moves_toward_player() {
        let mut ai = controller(BehaviorType::Defensive);
        ai.update(0.05, player_near(&ai, 10.0));
        for _ in 0..25 {
            let p = player_near(&ai, 10.0);
            ai.update(0.05, p);
        }
        assert_eq!(ai.state(), AiState::Chase);

        let before = ai.position();
        let target = Some(Perception {
            peer_id: PLAYER,
            position: Vec3::new(10.0, 0.0, 0.0),
        });
        ai.update(0.5, target);
        assert!(ai.position().x > before.x);
        assert!(ai.forward().x > 0.9);
    }

    #[test]
    fn test_attack_fires_once_per_cooldown() {
        let mut ai = controller(BehaviorType::Boss);
        ai.update(0.05, player_near(&ai, 1.0));
        assert_eq!(ai.state(), AiState::Alert);
        ai.update(1.1, player_near(&ai, 1.0));
        assert_eq!(ai.state(), AiState::Attack);
        ai.take_events();

        // Cooldown is 1.5s; 1.0s of frames should yield exactly one attack
        for _ in 0..10 {
            let p = player_near(&ai, 1.0);
            ai.update(0.1, p);
        }
        let attacks: Vec<_> = ai
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, AiEvent::Attack { .. }))
            .collect();
        assert_eq!(attacks.len(), 1);
        assert_eq!(
            attacks[0],
            AiEvent::Attack {
                ai_id: 1,
                target: PLAYER,
                damage: DEFAULT_ATTACK_DAMAGE
            }
        );

        // Past the cooldown a second attack lands
        for _ in 0..8 {
            let p = player_near(&ai, 1.0);
            ai.update(0.1, p);
        }
        assert!(ai
            .take_events()
            .iter()
            .any(|e| matches!(e, AiEvent::Attack { .. })));
    }

    #[test]
    fn test_attack_drops_to_chase_outside_leash() {
        let mut ai = controller(BehaviorType::Boss);
        ai.update(0.05, player_near(&ai, 1.0));
        ai.update(1.1, player_near(&ai, 1.0));
        assert_eq!(ai.state(), AiState::Attack);

        // 1.2 x 2.0 = 2.4; 2.3 keeps attacking, 3.0 does not
        ai.update(0.05, player_near(&ai, 2.3));
        assert_eq!(ai.state(), AiState::Attack);
        ai.update(0.05, player_near(&ai, 3.0));
        assert_eq!(ai.state(), AiState::Chase);
    }

    #[test]
    fn test_damage_to_death_is_terminal() {
        let mut ai = controller(BehaviorType::Defensive);
        let mut last_health = ai.health();

        for _ in 0..9 {
            assert!(!ai.apply_damage(10.0, Some(PLAYER)));
            assert!(ai.health() < last_health);
            last_health = ai.health();
        }

        assert!(ai.apply_damage(25.0, Some(PLAYER)));
        assert_eq!(ai.state(), AiState::Dead);
        assert_eq!(ai.health(), 0.0);

        // No further transitions or deaths
        assert!(!ai.apply_damage(10.0, Some(PLAYER)));
        ai.update(1.0, player_near(&ai, 1.0));
        ai.stun();
        assert_eq!(ai.state(), AiState::Dead);

        let deaths = ai
            .take_events()
            .into_iter()
            .filter(|e| matches!(e, AiEvent::Died { .. }))
            .count();
        assert_eq!(deaths, 1);
    }

    #[test]
    fn test_non_positive_damage_ignored() {
        let mut ai = controller(BehaviorType::Defensive);
        assert!(!ai.apply_damage(0.0, None));
        assert!(!ai.apply_damage(-5.0, None));
        assert!(!ai.apply_damage(f32::NAN, None));
        assert_eq!(ai.health(), DEFAULT_MAX_HEALTH);
        assert_eq!(ai.state(), AiState::Idle);
    }

    #[test]
    fn test_damage_escalates_idle_to_alert_with_attacker() {
        let mut ai = controller(BehaviorType::Defensive);
        ai.apply_damage(5.0, Some(99));
        assert_eq!(ai.state(), AiState::Alert);
        assert_eq!(ai.target(), Some(99));
    }

    #[test]
    fn test_idle_dwell_then_patrol() {
        let mut ai = AiController::new(
            3,
            BehaviorType::Passive,
            stats(),
            Vec3::ZERO,
            vec![Vec3::new(50.0, 0.0, 0.0)],
        );
        // Passive flight ends in Idle even with a patrol path
        ai.apply_damage(85.0, None);
        assert_eq!(ai.state(), AiState::Flee);
        ai.update(0.1, None);
        assert_eq!(ai.state(), AiState::Idle);

        // Dwell is randomized within 3-5 seconds
        ai.update(2.9, None);
        assert_eq!(ai.state(), AiState::Idle);
        ai.update(2.2, None);
        assert_eq!(ai.state(), AiState::Patrol);

        let mut idle = controller(BehaviorType::Defensive);
        idle.update(6.0, None);
        // No patrol path: stays idle
        assert_eq!(idle.state(), AiState::Idle);
    }

    #[test]
    fn test_patrol_advances_waypoints() {
        let path = vec![Vec3::new(0.5, 0.0, 0.0), Vec3::new(20.0, 0.0, 0.0)];
        let mut ai = AiController::new(4, BehaviorType::Defensive, stats(), Vec3::ZERO, path);

        // Arrival at the first waypoint moves the index on whether or not the
        // AI pauses in Idle; the longest dwell is 5 seconds.
        let mut passed_first = false;
        for _ in 0..80 {
            ai.update(0.1, None);
            if ai.position().x > WAYPOINT_ARRIVAL + 0.5 {
                passed_first = true;
                break;
            }
        }
        assert!(passed_first);
        assert_eq!(ai.state(), AiState::Patrol);
        assert!(ai.forward().x > 0.99);
    }

    #[test]
    fn test_patrol_detects_player_and_alerts() {
        let mut ai = AiController::new(
            6,
            BehaviorType::Defensive,
            stats(),
            Vec3::ZERO,
            vec![Vec3::new(30.0, 0.0, 0.0)],
        );
        assert_eq!(ai.state(), AiState::Patrol);

        // Outside detection range: keeps patrolling
        ai.update(0.1, player_near(&ai, 20.0));
        assert_eq!(ai.state(), AiState::Patrol);
        assert_eq!(ai.target(), None);

        ai.update(0.1, player_near(&ai, 10.0));
        assert_eq!(ai.state(), AiState::Alert);
        assert_eq!(ai.target(), Some(PLAYER));
        assert_eq!(
            state_changes(&ai.take_events()),
            vec![(AiState::Patrol, AiState::Alert)]
        );
    }

    #[test]
    fn test_alert_forgets_after_timeout() {
        let mut ai = AiController::new(
            5,
            BehaviorType::Defensive,
            stats(),
            Vec3::ZERO,
            vec![Vec3::new(30.0, 0.0, 0.0)],
        );
        ai.apply_damage(5.0, None);
        assert_eq!(ai.state(), AiState::Alert);

        ai.update(4.0, None);
        assert_eq!(ai.state(), AiState::Alert);
        ai.update(1.1, None);
        assert_eq!(ai.state(), AiState::Patrol);
        assert_eq!(ai.target(), None);
    }

    #[test]
    fn test_alert_chases_last_known_position() {
        let mut ai = controller(BehaviorType::Defensive);
        ai.update(0.05, player_near(&ai, 10.0));
        assert_eq!(ai.state(), AiState::Alert);

        // Lost sight immediately; last known position triggers a chase after the commit delay
        ai.update(0.5, None);
        assert_eq!(ai.state(), AiState::Alert);
        ai.update(0.6, None);
        assert_eq!(ai.state(), AiState::Chase);
    }

    #[test]
    fn test_chase_lost_near_last_known_position() {
        let mut ai = controller(BehaviorType::Defensive);
        ai.update(0.05, player_near(&ai, 3.0));
        ai.update(1.1, player_near(&ai, 3.0));
        assert_eq!(ai.state(), AiState::Chase);

        // Player vanishes; AI walks to the last known spot (3 units) and gives up
        for _ in 0..20 {
            ai.update(0.1, None);
            if ai.state() != AiState::Chase {
                break;
            }
        }
        assert_eq!(ai.state(), AiState::Alert);
        assert_eq!(ai.target(), None);

        // With nothing remembered, the alert times out back to rest
        ai.update(5.1, None);
        assert_eq!(ai.state(), AiState::Idle);
    }

    #[test]
    fn test_passive_flees_when_badly_hurt() {
        let mut ai = controller(BehaviorType::Passive);
        ai.apply_damage(85.0, Some(PLAYER));
        assert_eq!(ai.state(), AiState::Flee);

        let start = ai.position();
        ai.update(
            1.0,
            Some(Perception {
                peer_id: PLAYER,
                position: Vec3::new(5.0, 0.0, 0.0),
            }),
        );
        assert!(ai.position().x < start.x);

        // Beyond 2x detect range the flight ends
        ai.update(0.1, player_near(&ai, 31.0));
        assert_eq!(ai.state(), AiState::Idle);
    }

    #[test]
    fn test_defensive_does_not_flee() {
        let mut ai = controller(BehaviorType::Defensive);
        ai.apply_damage(85.0, Some(PLAYER));
        assert_eq!(ai.state(), AiState::Alert);
    }

    #[test]
    fn test_stun_ignores_perception() {
        let mut ai = controller(BehaviorType::Defensive);
        ai.stun();
        assert_eq!(ai.state(), AiState::Stunned);

        ai.update(1.0, player_near(&ai, 1.0));
        assert_eq!(ai.state(), AiState::Stunned);
        ai.update(1.1, player_near(&ai, 1.0));
        assert_eq!(ai.state(), AiState::Alert);
    }

    #[test]
    fn test_hurt_non_boss_retreats_to_cover() {
        let mut ai = controller(BehaviorType::Defensive);
        ai.apply_damage(75.0, Some(PLAYER));
        ai.update(1.1, player_near(&ai, 1.0));
        assert_eq!(ai.state(), AiState::Attack);

        let mut reached_cover = false;
        for _ in 0..200 {
            let p = player_near(&ai, 1.0);
            ai.update(0.01, p);
            if ai.state() == AiState::Cover {
                reached_cover = true;
                break;
            }
        }
        assert!(reached_cover);
    }

    #[test]
    fn test_boss_never_takes_cover() {
        let mut ai = controller(BehaviorType::Boss);
        ai.apply_damage(75.0, Some(PLAYER));
        ai.update(1.1, player_near(&ai, 1.0));
        assert_eq!(ai.state(), AiState::Attack);

        for _ in 0..200 {
            let p = player_near(&ai, 1.0);
            ai.update(0.01, p);
            assert_eq!(ai.state(), AiState::Attack);
        }
    }

    #[test]
    fn test_aggressive_leaves_cover_to_chase() {
        let mut ai = controller(BehaviorType::Aggressive);
        ai.apply_damage(75.0, Some(PLAYER));
        ai.update(1.1, player_near(&ai, 1.0));
        while ai.state() != AiState::Cover {
            let p = player_near(&ai, 1.0);
            ai.update(0.01, p);
        }

        ai.update(3.1, player_near(&ai, 5.0));
        assert_eq!(ai.state(), AiState::Chase);
    }

    #[test]
    fn test_cover_returns_to_rest_when_player_gone() {
        let mut ai = controller(BehaviorType::Defensive);
        ai.apply_damage(75.0, Some(PLAYER));
        ai.update(1.1, player_near(&ai, 1.0));
        while ai.state() != AiState::Cover {
            let p = player_near(&ai, 1.0);
            ai.update(0.01, p);
        }

        ai.update(3.1, None);
        assert_eq!(ai.state(), AiState::Idle);
    }
}
