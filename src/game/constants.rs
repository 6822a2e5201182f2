/// AI behavior tuning
pub mod ai {
    /// Minimum interval between full registry passes (ms)
    pub const TICK_INTERVAL_MS: u64 = 50;
    /// Largest dt fed to a controller in one pass (seconds); longer stalls are clamped
    pub const MAX_STEP_SECONDS: f32 = 0.25;
    /// Idle dwell before patrolling (seconds, randomized in range)
    pub const IDLE_DWELL_MIN: f32 = 3.0;
    pub const IDLE_DWELL_MAX: f32 = 5.0;
    /// Distance at which a waypoint counts as reached
    pub const WAYPOINT_ARRIVAL: f32 = 1.0;
    /// Chance to fall back to idle on reaching a waypoint
    pub const PATROL_IDLE_CHANCE: f64 = 0.2;
    /// Time spent alert before committing to chase/attack
    pub const ALERT_COMMIT_SECONDS: f32 = 1.0;
    /// Time without seeing a player before an alert AI gives up
    pub const ALERT_FORGET_SECONDS: f32 = 5.0;
    /// Distance to an unseen last-known position at which a chase is lost
    pub const CHASE_LOST_DISTANCE: f32 = 2.0;
    /// Attack keeps going while target is within this multiple of attack range
    pub const ATTACK_LEASH_FACTOR: f32 = 1.2;
    /// Below this health fraction non-boss AIs may retreat to cover
    pub const COVER_HEALTH_FRACTION: f32 = 0.3;
    /// Per-attack-frame chance to retreat to cover once hurt
    pub const COVER_CHANCE: f64 = 0.3;
    /// Time held in cover before re-evaluating
    pub const COVER_HOLD_SECONDS: f32 = 3.0;
    /// Health fraction considered recovered when leaving cover
    pub const COVER_RECOVERED_FRACTION: f32 = 0.5;
    /// Health regenerated per second while in cover, as fraction of max
    pub const COVER_REGEN_FRACTION_PER_SEC: f32 = 0.02;
    /// Passive AIs flee below this health fraction
    pub const FLEE_HEALTH_FRACTION: f32 = 0.2;
    /// Fleeing stops beyond this multiple of detect range
    pub const FLEE_CLEAR_FACTOR: f32 = 2.0;
    /// Fixed stun duration
    pub const STUN_SECONDS: f32 = 2.0;

    /// Defaults used when a spawn point omits stats
    pub const DEFAULT_DETECT_RANGE: f32 = 15.0;
    pub const DEFAULT_ATTACK_RANGE: f32 = 2.0;
    pub const DEFAULT_MOVE_SPEED: f32 = 3.5;
    pub const DEFAULT_ATTACK_DAMAGE: f32 = 10.0;
    pub const DEFAULT_ATTACK_COOLDOWN: f32 = 1.5;
    pub const DEFAULT_MAX_HEALTH: f32 = 100.0;
}

/// Loot and transfer locks
pub mod items {
    /// Lifetime of a transfer lock (ms)
    pub const LOCK_TIMEOUT_MS: u64 = 2000;
    /// First id handed out for server-created containers
    pub const FIRST_CONTAINER_ID: u32 = 1;
    /// Player reach for pickups and container inspection
    pub const PICKUP_REACH: f32 = 4.0;
}

/// Player-placed structures
pub mod building {
    /// How far from the player a structure may be placed
    pub const BUILD_REACH: f32 = 8.0;
    /// First id handed out for placed buildings
    pub const FIRST_BUILDING_ID: u32 = 1;
}

/// Player session defaults
pub mod player {
    pub const DEFAULT_MAX_HEALTH: f32 = 100.0;
    /// Hotbar slots carried inline
    pub const HOTBAR_SLOTS: usize = 8;
    /// Maximum display name length (characters)
    pub const MAX_NAME_LEN: usize = 32;
}

/// Tick and dispatch budgets
pub mod tick {
    /// Outer loop rate in Hz
    pub const TICK_RATE: u32 = 30;
    /// Tick duration in milliseconds
    pub const TICK_DURATION_MS: u64 = 1000 / TICK_RATE as u64;
    /// Dirty-state flush interval (ms)
    pub const SYNC_FLUSH_INTERVAL_MS: u64 = 33;
    /// Full transform snapshot every N flushes
    pub const TRANSFORM_SNAPSHOT_EVERY: u32 = 10;
    /// Per-tick message ceiling for the priority queue
    pub const QUEUE_MAX_MESSAGES: usize = 100;
    /// Per-tick byte ceiling for the priority queue
    pub const QUEUE_MAX_BYTES: usize = 65536;
}

/// Change detection thresholds for dirty marking
pub mod sync {
    /// Position change threshold (world units)
    pub const POSITION_EPSILON: f32 = 0.01;
    /// Rotation change threshold (radians)
    pub const ROTATION_EPSILON: f32 = 0.01;
    /// Velocity change threshold (units/second)
    pub const VELOCITY_EPSILON: f32 = 0.05;
}

/// Anti-cheat thresholds
pub mod anticheat {
    /// Maximum horizontal speed a player may report (units/second)
    pub const MAX_PLAYER_SPEED: f32 = 12.0;
    /// Slack for latency and float error on movement checks
    pub const SPEED_TOLERANCE: f32 = 1.25;
    /// Single-report distance that is always a teleport
    pub const TELEPORT_DISTANCE: f32 = 50.0;
    /// Extra reach allowed for interaction distance checks
    pub const REACH_TOLERANCE: f32 = 1.0;
}

/// Network framing limits
pub mod net {
    /// Maximum framed message size in bytes
    pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;
    /// Maximum inbound messages per peer per second
    pub const MAX_MESSAGES_PER_SECOND: u32 = 120;
}
