//! Item authority
//!
//! Loot containers and the transfer locks guarding their slots. A pickup is
//! two-phase: `validate_pickup` takes a short-lived lock on (container, slot)
//! for the requester, then `confirm_pickup` moves the item out and releases
//! the lock, or `reject_pickup` releases it with a reason. A lock whose age
//! exceeds the timeout is treated as absent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::game::constants::items::FIRST_CONTAINER_ID;
use crate::game::state::{ContainerId, ItemStack, PeerId};
use crate::net::protocol::{ContainerSnapshot, LootSource, ServerMessage, SlotEntry};
use crate::net::queue::{MessageQueue, Priority};
use crate::net::transport::Delivery;
use crate::util::vec3::Vec3;

/// How a container came to exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOrigin {
    /// Placed by the scene catalog; looted state is persisted by spawn id
    Scene { spawn_id: String },
    /// A player dropped an item
    Drop { peer_id: PeerId },
    /// Left behind by a death
    DeadLoot { source: LootSource },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LootContainer {
    pub id: ContainerId,
    pub scene_id: String,
    pub kind: String,
    pub position: Vec3,
    pub slots: BTreeMap<u32, ItemStack>,
    pub origin: ContainerOrigin,
}

impl LootContainer {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_entries(&self) -> Vec<SlotEntry> {
        self.slots
            .iter()
            .map(|(&slot, item)| SlotEntry {
                slot,
                item: item.clone(),
            })
            .collect()
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            container_id: self.id,
            kind: self.kind.clone(),
            position: self.position,
            slots: self.slot_entries(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLock {
    pub holder: PeerId,
    pub acquired_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItemError {
    #[error("unknown container {0}")]
    UnknownContainer(ContainerId),
    #[error("slot {slot} of container {container} is empty")]
    SlotEmpty { container: ContainerId, slot: u32 },
    #[error("slot {slot} of container {container} is locked by peer {holder}")]
    Locked {
        container: ContainerId,
        slot: u32,
        holder: PeerId,
    },
    #[error("slot {slot} of container {container} is not locked by the requester")]
    NotLockHolder { container: ContainerId, slot: u32 },
}

impl ItemError {
    /// Reason code sent to clients
    pub fn reason(&self) -> &'static str {
        match self {
            ItemError::UnknownContainer(_) => "unknown container",
            ItemError::SlotEmpty { .. } => "slot empty",
            ItemError::Locked { .. } => "locked",
            ItemError::NotLockHolder { .. } => "not lock holder",
        }
    }
}

/// Result of a confirmed pickup
#[derive(Debug, Clone, PartialEq)]
pub struct PickupOutcome {
    pub container_id: ContainerId,
    pub slot: u32,
    pub item: ItemStack,
    /// The container has no items left
    pub emptied: bool,
    pub origin: ContainerOrigin,
}

struct ItemState {
    containers: HashMap<ContainerId, LootContainer>,
    locks: HashMap<(ContainerId, u32), TransferLock>,
    next_id: ContainerId,
}

impl ItemState {
    fn allocate_id(&mut self) -> ContainerId {
        while self.containers.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1).max(FIRST_CONTAINER_ID);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(FIRST_CONTAINER_ID);
        id
    }

    fn live_lock(&self, key: (ContainerId, u32), now: Instant, timeout: Duration) -> Option<TransferLock> {
        self.locks
            .get(&key)
            .copied()
            .filter(|lock| now.saturating_duration_since(lock.acquired_at) < timeout)
    }
}

pub struct ItemAuthority {
    state: Mutex<ItemState>,
    queue: Arc<MessageQueue>,
    lock_timeout: Duration,
}

impl ItemAuthority {
    pub fn new(queue: Arc<MessageQueue>, lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ItemState {
                containers: HashMap::new(),
                locks: HashMap::new(),
                next_id: FIRST_CONTAINER_ID,
            }),
            queue,
            lock_timeout,
        }
    }

    pub fn validate_pickup(
        &self,
        peer_id: PeerId,
        container_id: ContainerId,
        slot: u32,
    ) -> Result<(), ItemError> {
        self.validate_pickup_at(Instant::now(), peer_id, container_id, slot)
    }

    /// Check a pickup and take the transfer lock. Re-validation by the
    /// current holder refreshes the lock.
    pub fn validate_pickup_at(
        &self,
        now: Instant,
        peer_id: PeerId,
        container_id: ContainerId,
        slot: u32,
    ) -> Result<(), ItemError> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get(&container_id)
            .ok_or(ItemError::UnknownContainer(container_id))?;
        if !container.slots.contains_key(&slot) {
            return Err(ItemError::SlotEmpty {
                container: container_id,
                slot,
            });
        }

        let key = (container_id, slot);
        if let Some(lock) = state.live_lock(key, now, self.lock_timeout) {
            if lock.holder != peer_id {
                return Err(ItemError::Locked {
                    container: container_id,
                    slot,
                    holder: lock.holder,
                });
            }
        }

        state.locks.insert(
            key,
            TransferLock {
                holder: peer_id,
                acquired_at: now,
            },
        );
        Ok(())
    }

    pub fn confirm_pickup(
        &self,
        peer_id: PeerId,
        container_id: ContainerId,
        slot: u32,
    ) -> Result<PickupOutcome, ItemError> {
        self.confirm_pickup_at(Instant::now(), peer_id, container_id, slot)
    }

    /// Move the item out of the slot and release the lock. Broadcasts
    /// `itemPickupConfirm`.
    pub fn confirm_pickup_at(
        &self,
        now: Instant,
        peer_id: PeerId,
        container_id: ContainerId,
        slot: u32,
    ) -> Result<PickupOutcome, ItemError> {
        let outcome = {
            let mut state = self.state.lock();
            let key = (container_id, slot);

            if !state.containers.contains_key(&container_id) {
                state.locks.remove(&key);
                return Err(ItemError::UnknownContainer(container_id));
            }
            match state.live_lock(key, now, self.lock_timeout) {
                Some(lock) if lock.holder != peer_id => {
                    return Err(ItemError::Locked {
                        container: container_id,
                        slot,
                        holder: lock.holder,
                    });
                }
                // An expired or missing lock is fine as long as nobody else holds one
                _ => {}
            }

            state.locks.remove(&key);
            let container = state
                .containers
                .get_mut(&container_id)
                .ok_or(ItemError::UnknownContainer(container_id))?;
            let item = container.slots.remove(&slot).ok_or(ItemError::SlotEmpty {
                container: container_id,
                slot,
            })?;

            PickupOutcome {
                container_id,
                slot,
                item,
                emptied: container.is_empty(),
                origin: container.origin.clone(),
            }
        };

        tracing::debug!(
            "Peer {} picked up {}x{} from container {} slot {}",
            peer_id,
            outcome.item.count,
            outcome.item.item_type,
            container_id,
            slot
        );

        self.queue.broadcast(
            &ServerMessage::ItemPickupConfirm {
                peer_id,
                container_id,
                slot,
                item: outcome.item.clone(),
            },
            Delivery::Reliable,
            Priority::High,
        );
        Ok(outcome)
    }

    /// Release the requester's lock (if any) and tell them why.
    pub fn reject_pickup(&self, peer_id: PeerId, container_id: ContainerId, slot: u32, reason: &str) {
        {
            let mut state = self.state.lock();
            let key = (container_id, slot);
            if state.locks.get(&key).is_some_and(|l| l.holder == peer_id) {
                state.locks.remove(&key);
            }
        }

        self.queue.to_peer(
            peer_id,
            &ServerMessage::ItemPickupReject {
                container_id,
                slot,
                reason: reason.to_string(),
            },
            Delivery::Reliable,
            Priority::High,
        );
    }

    /// Put a dropped item into a new single-slot container and broadcast it
    pub fn drop_item(&self, peer_id: PeerId, scene_id: &str, position: Vec3, item: ItemStack) -> ContainerId {
        let container_id = self.insert(
            scene_id,
            "drop",
            position,
            vec![item.clone()],
            ContainerOrigin::Drop { peer_id },
        );

        self.queue.broadcast(
            &ServerMessage::ItemDropConfirm {
                peer_id,
                container_id,
                position,
                item,
            },
            Delivery::Reliable,
            Priority::High,
        );
        container_id
    }

    /// Create a container without announcing it (scene contents go out in
    /// the scene snapshot)
    pub fn spawn_container(
        &self,
        scene_id: &str,
        kind: &str,
        position: Vec3,
        items: Vec<ItemStack>,
        origin: ContainerOrigin,
    ) -> ContainerId {
        self.insert(scene_id, kind, position, items, origin)
    }

    /// Create a dead-loot container and broadcast `deadLootSpawn`. Nothing is
    /// created for an empty item list.
    pub fn spawn_dead_loot(
        &self,
        scene_id: &str,
        position: Vec3,
        items: Vec<ItemStack>,
        source: LootSource,
    ) -> Option<ContainerId> {
        if items.is_empty() {
            return None;
        }

        let container_id = self.insert(
            scene_id,
            "dead_loot",
            position,
            items.clone(),
            ContainerOrigin::DeadLoot { source },
        );

        self.queue.broadcast(
            &ServerMessage::DeadLootSpawn {
                container_id,
                position,
                items,
                source,
            },
            Delivery::Reliable,
            Priority::High,
        );
        Some(container_id)
    }

    fn insert(
        &self,
        scene_id: &str,
        kind: &str,
        position: Vec3,
        items: Vec<ItemStack>,
        origin: ContainerOrigin,
    ) -> ContainerId {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        let slots = items
            .into_iter()
            .enumerate()
            .map(|(slot, item)| (slot as u32, item))
            .collect();
        state.containers.insert(
            id,
            LootContainer {
                id,
                scene_id: scene_id.to_string(),
                kind: kind.to_string(),
                position,
                slots,
                origin,
            },
        );
        id
    }

    /// Drop every lock a peer holds (disconnect). Returns how many were released.
    pub fn release_locks_for(&self, peer_id: PeerId) -> usize {
        let mut state = self.state.lock();
        let before = state.locks.len();
        state.locks.retain(|_, lock| lock.holder != peer_id);
        before - state.locks.len()
    }

    /// Sweep locks older than the timeout
    pub fn purge_expired(&self, now: Instant) -> usize {
        let timeout = self.lock_timeout;
        let mut state = self.state.lock();
        let before = state.locks.len();
        state
            .locks
            .retain(|_, lock| now.saturating_duration_since(lock.acquired_at) < timeout);
        before - state.locks.len()
    }

    /// Remove every container of an unloaded scene, with its locks
    pub fn remove_scene(&self, scene_id: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.containers.len();
        state.containers.retain(|_, c| c.scene_id != scene_id);
        let ItemState {
            containers, locks, ..
        } = &mut *state;
        locks.retain(|(container_id, _), _| containers.contains_key(container_id));
        before - containers.len()
    }

    pub fn container(&self, container_id: ContainerId) -> Option<LootContainer> {
        self.state.lock().containers.get(&container_id).cloned()
    }

    pub fn in_scene(&self, scene_id: &str) -> Vec<LootContainer> {
        let state = self.state.lock();
        let mut containers: Vec<LootContainer> = state
            .containers
            .values()
            .filter(|c| c.scene_id == scene_id)
            .cloned()
            .collect();
        containers.sort_by_key(|c| c.id);
        containers
    }

    /// Current live holder of a slot lock
    pub fn lock_holder(&self, container_id: ContainerId, slot: u32, now: Instant) -> Option<PeerId> {
        let state = self.state.lock();
        state
            .live_lock((container_id, slot), now, self.lock_timeout)
            .map(|lock| lock.holder)
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn lock_count(&self) -> usize {
        self.state.lock().locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::LoopbackTransport;

    const TIMEOUT: Duration = Duration::from_millis(2000);

    fn setup() -> (ItemAuthority, Arc<MessageQueue>) {
        let queue = Arc::new(MessageQueue::new(100, 65536));
        (ItemAuthority::new(queue.clone(), TIMEOUT), queue)
    }

    fn crate_with(items: &ItemAuthority, stacks: Vec<ItemStack>) -> ContainerId {
        items.spawn_container(
            "farm",
            "crate",
            Vec3::ZERO,
            stacks,
            ContainerOrigin::Scene {
                spawn_id: "farm_crate_1".to_string(),
            },
        )
    }

    #[test]
    fn test_second_requester_sees_locked() {
        let (items, _) = setup();
        let id = crate_with(&items, vec![ItemStack::new("ammo_9mm", 30)]);
        let now = Instant::now();

        assert!(items.validate_pickup_at(now, 1, id, 0).is_ok());
        let err = items.validate_pickup_at(now, 2, id, 0).unwrap_err();
        assert_eq!(err.reason(), "locked");
        assert_eq!(items.lock_holder(id, 0, now), Some(1));
    }

    #[test]
    fn test_holder_revalidation_refreshes_lock() {
        let (items, _) = setup();
        let id = crate_with(&items, vec![ItemStack::new("ammo_9mm", 30)]);
        let t0 = Instant::now();

        items.validate_pickup_at(t0, 1, id, 0).unwrap();
        items
            .validate_pickup_at(t0 + Duration::from_millis(1500), 1, id, 0)
            .unwrap();
        assert_eq!(items.lock_count(), 1);

        // Still held 2.5s after the first validation because it was refreshed
        let later = t0 + Duration::from_millis(2500);
        assert!(items.validate_pickup_at(later, 2, id, 0).is_err());
    }

    #[test]
    fn test_expired_lock_is_ignored() {
        let (items, _) = setup();
        let id = crate_with(&items, vec![ItemStack::new("ammo_9mm", 30)]);
        let t0 = Instant::now();

        items.validate_pickup_at(t0, 1, id, 0).unwrap();
        let after = t0 + TIMEOUT + Duration::from_millis(1);
        assert!(items.validate_pickup_at(after, 2, id, 0).is_ok());
        assert_eq!(items.lock_holder(id, 0, after), Some(2));
    }

    #[test]
    fn test_confirm_moves_item_and_second_confirm_is_slot_empty() {
        let (items, queue) = setup();
        let id = crate_with(&items, vec![ItemStack::new("med_bandage", 1)]);
        let now = Instant::now();

        items.validate_pickup_at(now, 1, id, 0).unwrap();
        let outcome = items.confirm_pickup_at(now, 1, id, 0).unwrap();
        assert_eq!(outcome.item, ItemStack::new("med_bandage", 1));
        assert!(outcome.emptied);
        assert_eq!(items.lock_count(), 0);

        let err = items.confirm_pickup_at(now, 1, id, 0).unwrap_err();
        assert_eq!(err.reason(), "slot empty");

        let transport = LoopbackTransport::new();
        transport.connect(1);
        transport.connect(2);
        queue.drain(&transport);
        let seen = transport.take_messages_for(2);
        assert!(matches!(
            seen.as_slice(),
            [ServerMessage::ItemPickupConfirm { peer_id: 1, slot: 0, .. }]
        ));
    }

    #[test]
    fn test_confirm_by_non_holder_is_locked() {
        let (items, _) = setup();
        let id = crate_with(&items, vec![ItemStack::new("ammo_9mm", 30)]);
        let now = Instant::now();

        items.validate_pickup_at(now, 1, id, 0).unwrap();
        let err = items.confirm_pickup_at(now, 2, id, 0).unwrap_err();
        assert_eq!(err.reason(), "locked");
        assert!(items.container(id).unwrap().slots.contains_key(&0));
    }

    #[test]
    fn test_unknown_container_and_empty_slot() {
        let (items, _) = setup();
        let id = crate_with(&items, vec![ItemStack::new("ammo_9mm", 30)]);

        assert_eq!(
            items.validate_pickup(1, 999, 0).unwrap_err(),
            ItemError::UnknownContainer(999)
        );
        assert_eq!(
            items.validate_pickup(1, id, 5).unwrap_err().reason(),
            "slot empty"
        );
    }

    #[test]
    fn test_reject_clears_only_own_lock_and_notifies() {
        let (items, queue) = setup();
        let id = crate_with(&items, vec![ItemStack::new("ammo_9mm", 30)]);
        let now = Instant::now();

        items.validate_pickup_at(now, 1, id, 0).unwrap();
        items.reject_pickup(2, id, 0, "locked");
        assert_eq!(items.lock_holder(id, 0, now), Some(1));

        items.reject_pickup(1, id, 0, "out of reach");
        assert_eq!(items.lock_holder(id, 0, now), None);

        let transport = LoopbackTransport::new();
        transport.connect(1);
        transport.connect(2);
        queue.drain(&transport);
        assert_eq!(
            transport.take_messages_for(2),
            vec![ServerMessage::ItemPickupReject {
                container_id: id,
                slot: 0,
                reason: "locked".to_string()
            }]
        );
    }

    #[test]
    fn test_release_locks_for_disconnected_peer() {
        let (items, _) = setup();
        let a = crate_with(&items, vec![ItemStack::new("a", 1), ItemStack::new("b", 1)]);
        let b = crate_with(&items, vec![ItemStack::new("c", 1)]);
        let now = Instant::now();

        items.validate_pickup_at(now, 7, a, 1).unwrap();
        items.validate_pickup_at(now, 7, b, 0).unwrap();
        items.validate_pickup_at(now, 8, a, 0).unwrap();

        assert_eq!(items.release_locks_for(7), 2);
        assert_eq!(items.lock_holder(a, 1, now), None);
        assert_eq!(items.lock_holder(a, 0, now), Some(8));
        assert!(items.validate_pickup_at(now, 9, a, 1).is_ok());
    }

    #[test]
    fn test_purge_expired() {
        let (items, _) = setup();
        let id = crate_with(&items, vec![ItemStack::new("a", 1), ItemStack::new("b", 1)]);
        let t0 = Instant::now();

        items.validate_pickup_at(t0, 1, id, 0).unwrap();
        items
            .validate_pickup_at(t0 + Duration::from_millis(1500), 2, id, 1)
            .unwrap();

        assert_eq!(items.purge_expired(t0 + Duration::from_millis(2100)), 1);
        assert_eq!(items.lock_count(), 1);
    }

    #[test]
    fn test_drop_creates_single_slot_container() {
        let (items, _) = setup();
        let id = items.drop_item(3, "farm", Vec3::new(1.0, 0.0, 1.0), ItemStack::new("scrap", 4));
        let container = items.container(id).unwrap();
        assert_eq!(container.slots.len(), 1);
        assert_eq!(container.slots[&0], ItemStack::new("scrap", 4));
        assert_eq!(container.origin, ContainerOrigin::Drop { peer_id: 3 });
    }

    #[test]
    fn test_empty_dead_loot_not_created() {
        let (items, queue) = setup();
        assert!(items
            .spawn_dead_loot("farm", Vec3::ZERO, vec![], LootSource::Ai(1))
            .is_none());
        assert!(queue.is_empty());
        assert_eq!(items.container_count(), 0);
    }

    #[test]
    fn test_remove_scene_drops_containers_and_locks() {
        let (items, _) = setup();
        let farm = crate_with(&items, vec![ItemStack::new("a", 1)]);
        let bunker = items.spawn_container(
            "bunker",
            "crate",
            Vec3::ZERO,
            vec![ItemStack::new("b", 1)],
            ContainerOrigin::Scene {
                spawn_id: "bunker_crate".to_string(),
            },
        );
        items.validate_pickup(1, farm, 0).unwrap();

        assert_eq!(items.remove_scene("farm"), 1);
        assert!(items.container(farm).is_none());
        assert!(items.container(bunker).is_some());
        assert_eq!(items.lock_count(), 0);
    }

    #[test]
    fn test_container_ids_are_unique() {
        let (items, _) = setup();
        let a = crate_with(&items, vec![ItemStack::new("a", 1)]);
        let b = crate_with(&items, vec![ItemStack::new("b", 1)]);
        assert_ne!(a, b);
        assert_eq!(items.in_scene("farm").len(), 2);
    }
}
