use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use tokio::time::Instant;
use tracing::debug;

use super::hub::EntitySnapshot;
use super::state::ActiveLook;
use super::state::CapabilitySet;
use super::state::ChannelState;
use super::state::EntityId;
use super::state::MiredRange;
use super::state::WhiteLevels;

/// Everything the engine remembers about one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub state: ChannelState,

    /// `None` until discovery has reported capabilities.
    pub capabilities: Option<CapabilitySet>,

    /// Color dimension last touched by the user, if any.
    pub active_look: Option<ActiveLook>,

    /// Whether hue/saturation values came from a real source.
    pub hs_known: bool,

    /// Whether the mired value came from a real source.
    pub temp_known: bool,

    pub white: WhiteLevels,

    /// Last time any write touched this record.
    pub updated_at: Option<Instant>,
}

impl EntityRecord {
    fn new(default_range: MiredRange) -> Self {
        Self {
            state: ChannelState::default().clamped(default_range),
            capabilities: None,
            active_look: None,
            hs_known: false,
            temp_known: false,
            white: WhiteLevels::default(),
            updated_at: None,
        }
    }

    /// Capabilities, falling back to the conservative default.
    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities.unwrap_or_default()
    }

    pub fn mired_range(&self, default_range: MiredRange) -> MiredRange {
        self.capabilities
            .and_then(|c| c.mired_range)
            .unwrap_or(default_range)
    }
}

/// Per-entity in-memory view of device state.
///
/// A single mutex protects the whole map. Every write goes through
/// [`EntityStateCache::update`], which re-clamps the channel state before the
/// lock is released.
#[derive(Debug)]
pub struct EntityStateCache {
    entries: Mutex<HashMap<EntityId, EntityRecord>>,
    default_range: MiredRange,
}

impl EntityStateCache {
    pub fn new(default_range: MiredRange) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_range,
        }
    }

    // Every write re-clamps, so a poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<EntityId, EntityRecord>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mired bounds used for entities that did not report their own.
    pub fn default_range(&self) -> MiredRange {
        self.default_range
    }

    /// Current channel state, or a clamped zero record if the entity is unknown.
    pub fn get(&self, id: &EntityId) -> ChannelState {
        self.lock()
            .get(id)
            .map(|r| r.state)
            .unwrap_or_else(|| ChannelState::default().clamped(self.default_range))
    }

    /// Snapshot of the full record, if the entity has been referenced.
    pub fn record(&self, id: &EntityId) -> Option<EntityRecord> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.lock().contains_key(id)
    }

    /// Whether discovery has reported capabilities for this entity.
    pub fn is_seeded(&self, id: &EntityId) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|r| r.capabilities.is_some())
    }

    pub fn capabilities(&self, id: &EntityId) -> CapabilitySet {
        self.lock()
            .get(id)
            .map(EntityRecord::capabilities)
            .unwrap_or_default()
    }

    pub fn mired_range(&self, id: &EntityId) -> MiredRange {
        self.lock()
            .get(id)
            .map(|r| r.mired_range(self.default_range))
            .unwrap_or(self.default_range)
    }

    /// Apply `mutator` to the entity's channel state and store the clamped result.
    pub fn set(
        &self,
        id: &EntityId,
        mutator: impl FnOnce(ChannelState) -> ChannelState,
    ) -> ChannelState {
        self.update(id, |record| record.state = mutator(record.state))
            .1
    }

    /// Mutate the full record under the lock, creating it lazily.
    ///
    /// Returns the mutator's result and the clamped state after the write.
    pub fn update<R>(
        &self,
        id: &EntityId,
        mutator: impl FnOnce(&mut EntityRecord) -> R,
    ) -> (R, ChannelState) {
        let mut entries = self.lock();
        let record = entries
            .entry(id.clone())
            .or_insert_with(|| EntityRecord::new(self.default_range));

        let result = mutator(record);

        let range = record.mired_range(self.default_range);
        record.state = record.state.clamped(range);
        record.updated_at = Some(Instant::now());
        (result, record.state)
    }

    /// Seed an entity from bulk discovery.
    ///
    /// Capabilities are only taken the first time; channel values are always
    /// refreshed.
    pub fn seed(&self, snapshot: &EntitySnapshot) {
        self.update(&snapshot.entity_id, |record| {
            if record.capabilities.is_none() {
                record.capabilities = Some(snapshot.capabilities);
            } else if record.capabilities != Some(snapshot.capabilities) {
                debug!(
                    "Ignoring changed capabilities for {} during this session",
                    snapshot.entity_id
                );
            }

            let state = &snapshot.state;
            if let Some(on) = state.on {
                record.state.is_on = on;
            }
            if let Some(brightness) = state.brightness {
                record.state.brightness = brightness;
            }
            if let Some(mired) = state.color_temp_mired {
                record.state.color_temp_mired = mired;
                record.temp_known = true;
            }
            if let (Some(hue), Some(saturation)) = (state.hue, state.saturation) {
                record.state.hue = hue;
                record.state.saturation = saturation;
                record.hs_known = true;
            }
        });
    }

    /// Ids of every entity the cache has seen.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::hub::SnapshotState;
    use crate::engine::state::ColorMode;

    fn cache() -> EntityStateCache {
        EntityStateCache::new(MiredRange::default())
    }

    fn snapshot(id: &str) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: EntityId::new(id),
            state: SnapshotState {
                on: Some(true),
                brightness: Some(200),
                color_temp_mired: Some(300),
                hue: Some(30.0),
                saturation: Some(80.0),
            },
            capabilities: CapabilitySet {
                on_off: true,
                brightness: true,
                color_temp: true,
                color_hs: true,
                preferred_color_mode: Some(ColorMode::Rgb),
                mired_range: Some(MiredRange::new(200, 400)),
            },
        }
    }

    #[test]
    fn test_get_absent_returns_default() {
        let cache = cache();
        let state = cache.get(&EntityId::new("light.unknown"));
        assert_eq!(state.brightness, 0);
        assert!(!state.is_on);
        assert_eq!(state.color_temp_mired, 153);
        assert!(!cache.contains(&EntityId::new("light.unknown")));
    }

    #[test]
    fn test_set_clamps() {
        let cache = cache();
        let id = EntityId::new("light.a");
        let state = cache.set(&id, |mut s| {
            s.hue = 365.0;
            s.saturation = -5.0;
            s.color_temp_mired = 9000;
            s
        });
        assert!((state.hue - 5.0).abs() < 1e-9);
        assert_eq!(state.saturation, 0.0);
        assert_eq!(state.color_temp_mired, 500);
        assert_eq!(cache.get(&id), state);
    }

    #[test]
    fn test_capabilities_default_until_seeded() {
        let cache = cache();
        let id = EntityId::new("light.a");
        assert_eq!(cache.capabilities(&id), CapabilitySet::default());
        assert!(!cache.is_seeded(&id));

        cache.seed(&snapshot("light.a"));
        assert!(cache.is_seeded(&id));
        assert!(cache.capabilities(&id).brightness);
        assert_eq!(cache.mired_range(&id), MiredRange::new(200, 400));
    }

    #[test]
    fn test_seed_keeps_first_capabilities() {
        let cache = cache();
        let id = EntityId::new("LIGHT.A");
        cache.seed(&snapshot("light.a"));

        let mut changed = snapshot("light.a");
        changed.capabilities.color_hs = false;
        changed.state.brightness = Some(12);
        cache.seed(&changed);

        assert!(cache.capabilities(&id).color_hs);
        assert_eq!(cache.get(&id).brightness, 12);
    }

    #[test]
    fn test_seed_clamps_to_entity_range() {
        let cache = cache();
        let mut snap = snapshot("light.a");
        snap.state.color_temp_mired = Some(153);
        cache.seed(&snap);

        let record = cache.record(&EntityId::new("light.a")).unwrap();
        assert_eq!(record.state.color_temp_mired, 200);
        assert!(record.hs_known);
        assert!(record.temp_known);
    }
}
