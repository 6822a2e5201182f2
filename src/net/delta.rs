//! Dirty tracking for delta sync
//!
//! Mutations mark an entity dirty with a field mask. The flush drains the set
//! and builds deltas carrying only the masked fields. Marking is idempotent:
//! re-marking an entity ORs the masks instead of adding a second entry.

use std::hash::Hash;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::game::constants::sync::{POSITION_EPSILON, ROTATION_EPSILON, VELOCITY_EPSILON};
use crate::util::vec3::Vec3;

/// Field mask bits
pub mod fields {
    pub const TRANSFORM: u8 = 1 << 0;
    pub const HEALTH: u8 = 1 << 1;
    pub const EQUIPMENT: u8 = 1 << 2;
    pub const STATE: u8 = 1 << 3;
    pub const ANIMATION: u8 = 1 << 4;
    pub const SCENE: u8 = 1 << 5;
    pub const ALL: u8 = TRANSFORM | HEALTH | EQUIPMENT | STATE | ANIMATION | SCENE;
}

/// Set of dirty entity ids with accumulated field masks
#[derive(Debug)]
pub struct DirtySet<K> {
    entries: Mutex<HashMap<K, u8>>,
}

impl<K> Default for DirtySet<K> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Copy> DirtySet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, id: K, mask: u8) {
        if mask != 0 {
            *self.entries.lock().entry(id).or_insert(0) |= mask;
        }
    }

    /// Forget an entity (removed or disconnected)
    pub fn clear(&self, id: &K) {
        self.entries.lock().remove(id);
    }

    pub fn mask(&self, id: &K) -> Option<u8> {
        self.entries.lock().get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Take every entry, leaving the set empty. Marks made after this call
    /// land in the next drain.
    pub fn drain(&self) -> Vec<(K, u8)> {
        std::mem::take(&mut *self.entries.lock())
            .into_iter()
            .collect()
    }
}

/// Whether a transform moved enough to be worth sending
pub fn transform_changed(
    old_position: Vec3,
    new_position: Vec3,
    old_rotation: f32,
    new_rotation: f32,
    old_velocity: Vec3,
    new_velocity: Vec3,
) -> bool {
    !old_position.approx_eq(new_position, POSITION_EPSILON)
        || (old_rotation - new_rotation).abs() > ROTATION_EPSILON
        || !old_velocity.approx_eq(new_velocity, VELOCITY_EPSILON)
}

/// Whether an AI pose moved enough to be worth sending
pub fn pose_changed(old_position: Vec3, new_position: Vec3, old_forward: Vec3, new_forward: Vec3) -> bool {
    !old_position.approx_eq(new_position, POSITION_EPSILON)
        || !old_forward.approx_eq(new_forward, ROTATION_EPSILON)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_twice_is_one_entry() {
        let dirty = DirtySet::new();
        dirty.mark(1u64, fields::TRANSFORM);
        dirty.mark(1u64, fields::HEALTH);
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty.mask(&1), Some(fields::TRANSFORM | fields::HEALTH));
    }

    #[test]
    fn test_zero_mask_ignored() {
        let dirty: DirtySet<u64> = DirtySet::new();
        dirty.mark(1, 0);
        assert!(dirty.is_empty());
    }

    #[test]
    fn test_drain_empties_set() {
        let dirty = DirtySet::new();
        dirty.mark(1u64, fields::STATE);
        dirty.mark(2u64, fields::ALL);

        let mut drained = dirty.drain();
        drained.sort();
        assert_eq!(drained, vec![(1, fields::STATE), (2, fields::ALL)]);
        assert!(dirty.is_empty());

        dirty.mark(1u64, fields::HEALTH);
        assert_eq!(dirty.drain(), vec![(1, fields::HEALTH)]);
    }

    #[test]
    fn test_clear_removes_entry() {
        let dirty = DirtySet::new();
        dirty.mark(5u64, fields::TRANSFORM);
        dirty.clear(&5);
        assert!(dirty.mask(&5).is_none());
    }

    #[test]
    fn test_transform_epsilon() {
        let p = Vec3::new(1.0, 0.0, 1.0);
        assert!(!transform_changed(p, p, 0.0, 0.0, Vec3::ZERO, Vec3::ZERO));
        assert!(!transform_changed(
            p,
            Vec3::new(1.001, 0.0, 1.0),
            0.0,
            0.001,
            Vec3::ZERO,
            Vec3::ZERO
        ));
        assert!(transform_changed(p, Vec3::new(1.5, 0.0, 1.0), 0.0, 0.0, Vec3::ZERO, Vec3::ZERO));
        assert!(transform_changed(p, p, 0.0, 0.5, Vec3::ZERO, Vec3::ZERO));
        assert!(transform_changed(p, p, 0.0, 0.0, Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn test_pose_changed() {
        let p = Vec3::ZERO;
        assert!(!pose_changed(p, p, Vec3::FORWARD, Vec3::FORWARD));
        assert!(pose_changed(p, Vec3::new(0.5, 0.0, 0.0), Vec3::FORWARD, Vec3::FORWARD));
        assert!(pose_changed(p, p, Vec3::FORWARD, Vec3::new(1.0, 0.0, 0.0)));
    }
}
