use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::debug;
use tracing::trace;

use super::cache::EntityStateCache;
use super::dispatch::ChannelTarget;
use super::state::ActiveLook;
use super::state::Channel;
use super::state::ChannelState;
use super::state::EntityId;
use super::state::MiredRange;
use super::state::wrap_hue;

/// Size of one tick unit and the largest step a single event may apply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepSize {
    pub step: f64,
    pub burst_cap: f64,
}

impl StepSize {
    pub const fn new(step: f64, burst_cap: f64) -> Self {
        Self { step, burst_cap }
    }

    /// `delta * step`, with its magnitude capped to `burst_cap`.
    pub fn scaled(&self, delta: i32) -> f64 {
        let cap = self.burst_cap.abs();
        (f64::from(delta) * self.step).clamp(-cap, cap)
    }
}

/// Per-channel step sizes.
///
/// Brightness and saturation are in percent, hue in degrees and color
/// temperature in mired.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTable {
    pub brightness: StepSize,
    pub hue: StepSize,
    pub saturation: StepSize,
    pub color_temp: StepSize,
}

impl Default for StepTable {
    fn default() -> Self {
        Self {
            brightness: StepSize::new(1.0, 20.0),
            hue: StepSize::new(1.0, 30.0),
            saturation: StepSize::new(1.0, 20.0),
            color_temp: StepSize::new(5.0, 50.0),
        }
    }
}

impl StepTable {
    pub fn get(&self, channel: Channel) -> Option<StepSize> {
        match channel {
            Channel::Power => None,
            Channel::Brightness => Some(self.brightness),
            Channel::Hue => Some(self.hue),
            Channel::Saturation => Some(self.saturation),
            Channel::ColorTemp => Some(self.color_temp),
        }
    }
}

/// Brightness (0-255) as a whole percentage.
pub fn brightness_to_percent(brightness: u8) -> f64 {
    (f64::from(brightness) * 100.0 / 255.0).round()
}

pub fn percent_to_brightness(percent: f64) -> u8 {
    (percent.clamp(0.0, 100.0) * 255.0 / 100.0).round() as u8
}

/// Absolute target of applying `delta` ticks to `channel` of `state`.
///
/// Returns `None` for channels that cannot be ticked.
pub fn resolve_target(
    state: &ChannelState,
    range: MiredRange,
    channel: Channel,
    delta: i32,
    steps: &StepTable,
) -> Option<ChannelTarget> {
    let step = steps.get(channel)?.scaled(delta);

    let target = match channel {
        Channel::Power => return None,
        Channel::Brightness => {
            let percent = brightness_to_percent(state.brightness) + step;
            ChannelTarget::Brightness(percent_to_brightness(percent))
        }
        Channel::Hue => ChannelTarget::Hue(wrap_hue(state.hue + step)),
        Channel::Saturation => {
            ChannelTarget::Saturation((state.saturation + step).clamp(0.0, 100.0))
        }
        Channel::ColorTemp => {
            let mired = (f64::from(state.color_temp_mired) + step)
                .round()
                .clamp(f64::from(range.min), f64::from(range.max));
            ChannelTarget::ColorTemp(mired as u16)
        }
    };

    Some(target)
}

/// The latest coalesced value for a key and the timer that will deliver it.
#[derive(Debug)]
pub struct PendingTarget<V> {
    pub value: V,
    pub timer: u64,
    handle: AbortHandle,
}

#[derive(Debug)]
struct SchedulerInner<K, V> {
    next_timer: u64,
    waiting: HashMap<K, PendingTarget<V>>,
    /// Timers whose quiet period elapsed and whose callback is running
    firing: HashMap<u64, (K, AbortHandle)>,
}

/// Keyed "run this once things have been quiet for a while" scheduler.
///
/// Scheduling a key that is still waiting cancels the old timer, so only the
/// most recent value for a key is ever delivered. A callback that has already
/// started is left to finish unless the key is cancelled explicitly.
#[derive(Debug)]
pub struct DebounceScheduler<K, V> {
    inner: Arc<Mutex<SchedulerInner<K, V>>>,
}

fn lock<K, V>(inner: &Mutex<SchedulerInner<K, V>>) -> MutexGuard<'_, SchedulerInner<K, V>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> DebounceScheduler<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SchedulerInner {
                next_timer: 0,
                waiting: HashMap::new(),
                firing: HashMap::new(),
            })),
        }
    }

    /// (Re)arm the timer for `key`. After `delay` without another call for the
    /// same key, `f` runs with `value`. Returns the new timer id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: K, value: V, delay: Duration, f: F) -> u64
    where
        F: FnOnce(V) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = lock(&self.inner);
        let timer = inner.next_timer;
        inner.next_timer += 1;

        if let Some(old) = inner.waiting.remove(&key) {
            trace!("Superseding timer {}", old.timer);
            old.handle.abort();
        }

        let shared = self.inner.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let value = {
                let mut inner = lock(&shared);
                let current = inner
                    .waiting
                    .get(&task_key)
                    .is_some_and(|p| p.timer == timer);
                if !current {
                    return;
                }
                let Some(pending) = inner.waiting.remove(&task_key) else {
                    return;
                };
                inner.firing.insert(timer, (task_key, pending.handle));
                pending.value
            };

            f(value).await;

            lock(&shared).firing.remove(&timer);
        });

        inner.waiting.insert(
            key,
            PendingTarget {
                value,
                timer,
                handle: handle.abort_handle(),
            },
        );

        timer
    }

    /// Value still waiting for its quiet period to elapse, if any.
    pub fn pending(&self, key: &K) -> Option<V> {
        lock(&self.inner).waiting.get(key).map(|p| p.value.clone())
    }

    /// Abort every waiting or running timer whose key matches.
    pub fn cancel_where(&self, matches: impl Fn(&K) -> bool) -> usize {
        let mut inner = lock(&self.inner);
        let mut cancelled = 0;

        inner.waiting.retain(|key, pending| {
            if matches(key) {
                pending.handle.abort();
                cancelled += 1;
                false
            } else {
                true
            }
        });

        inner.firing.retain(|_, (key, handle)| {
            if matches(key) {
                handle.abort();
                cancelled += 1;
                false
            } else {
                true
            }
        });

        cancelled
    }

    /// Whether any waiting or running timer has a matching key.
    pub fn any_where(&self, matches: impl Fn(&K) -> bool) -> bool {
        let inner = lock(&self.inner);
        inner.waiting.keys().any(|key| matches(key))
            || inner.firing.values().any(|(key, _)| matches(key))
    }

    /// Number of timers waiting or running.
    pub fn len(&self) -> usize {
        let inner = lock(&self.inner);
        inner.waiting.len() + inner.firing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for DebounceScheduler<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for DebounceScheduler<K, V> {
    fn drop(&mut self) {
        let inner = lock(&self.inner);
        for pending in inner.waiting.values() {
            pending.handle.abort();
        }
        for (_, handle) in inner.firing.values() {
            handle.abort();
        }
    }
}

pub type PendingKey = (EntityId, Channel);

/// Turns rapid ticks into optimistic cache writes plus one delayed dispatch
/// per (entity, channel).
#[derive(Debug)]
pub struct ChannelDebouncer {
    steps: StepTable,
    quiet_period: Duration,
    scheduler: DebounceScheduler<PendingKey, ChannelTarget>,
}

impl ChannelDebouncer {
    pub fn new(steps: StepTable, quiet_period: Duration) -> Self {
        Self {
            steps,
            quiet_period,
            scheduler: DebounceScheduler::new(),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Apply `delta` ticks to the cache and (re)arm the quiet-period timer.
    ///
    /// Never blocks: only in-memory state is touched. When the timer expires
    /// `on_quiet` receives the latest target. Returns the optimistic target, or
    /// `None` if the entity does not support `channel`.
    pub fn tick<F, Fut>(
        &self,
        cache: &EntityStateCache,
        id: &EntityId,
        channel: Channel,
        delta: i32,
        on_quiet: F,
    ) -> Option<ChannelTarget>
    where
        F: FnOnce(ChannelTarget) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if channel == Channel::Power {
            debug!("Dropping {} tick for {}: not a dial channel", channel, id);
            return None;
        }
        if !cache.capabilities(id).allows(channel) {
            debug!("Dropping {} tick for {}: capability denied", channel, id);
            return None;
        }

        let default_range = cache.default_range();
        let key = (id.clone(), channel);
        // Re-armed under the cache lock so the pending target is always the
        // latest optimistic write
        let (target, _) = cache.update(id, |record| {
            let range = record.mired_range(default_range);
            let target = resolve_target(&record.state, range, channel, delta, &self.steps)?;
            target.apply(&mut record.state);

            match channel {
                Channel::Hue | Channel::Saturation => {
                    record.active_look = Some(ActiveLook::Hs);
                    record.hs_known = true;
                }
                Channel::ColorTemp => {
                    record.active_look = Some(ActiveLook::Temp);
                    record.temp_known = true;
                }
                Channel::Brightness | Channel::Power => {}
            }

            self.scheduler.schedule(key, target, self.quiet_period, on_quiet);
            Some(target)
        });
        let target = target?;

        trace!("Tick {} {} {:+} -> {:?}", id, channel, delta, target);
        Some(target)
    }

    pub fn pending(&self, id: &EntityId, channel: Channel) -> Option<ChannelTarget> {
        self.scheduler.pending(&(id.clone(), channel))
    }

    /// Cancel every timer of `id`, across all channels.
    pub fn cancel_entity(&self, id: &EntityId) -> usize {
        self.scheduler.cancel_where(|(entity, _)| entity == id)
    }

    /// Whether any channel of `id` is waiting or being dispatched.
    pub fn has_pending_for(&self, id: &EntityId) -> bool {
        self.scheduler.any_where(|(entity, _)| entity == id)
    }

    pub fn in_flight(&self) -> usize {
        self.scheduler.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::engine::hub::EntitySnapshot;
    use crate::engine::hub::SnapshotState;
    use crate::engine::state::CapabilitySet;

    fn full_caps() -> CapabilitySet {
        CapabilitySet {
            on_off: true,
            brightness: true,
            color_temp: true,
            color_hs: true,
            preferred_color_mode: None,
            mired_range: Some(MiredRange::new(153, 500)),
        }
    }

    fn seeded_cache(id: &str, state: SnapshotState) -> EntityStateCache {
        let cache = EntityStateCache::new(MiredRange::default());
        cache.seed(&EntitySnapshot {
            entity_id: EntityId::new(id),
            state,
            capabilities: full_caps(),
        });
        cache
    }

    #[test]
    fn test_step_burst_cap() {
        let size = StepSize::new(1.0, 20.0);
        assert_eq!(size.scaled(5), 5.0);
        assert_eq!(size.scaled(500), 20.0);
        assert_eq!(size.scaled(-500), -20.0);
    }

    #[test]
    fn test_brightness_percent_round_trip_is_stable() {
        for pct in 0..=100 {
            let raw = percent_to_brightness(f64::from(pct));
            assert_eq!(brightness_to_percent(raw), f64::from(pct));
        }
    }

    #[test]
    fn test_resolve_hue_wraps() {
        let state = ChannelState {
            hue: 359.9,
            ..Default::default()
        };
        let target = resolve_target(
            &state,
            MiredRange::default(),
            Channel::Hue,
            1,
            &StepTable::default(),
        );
        match target {
            Some(ChannelTarget::Hue(h)) => assert!((h - 0.9).abs() < 1e-9, "hue {h}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_resolve_clamps() {
        let steps = StepTable::default();
        let state = ChannelState {
            brightness: 250,
            saturation: 95.0,
            color_temp_mired: 490,
            ..Default::default()
        };
        let range = MiredRange::new(153, 500);

        assert_eq!(
            resolve_target(&state, range, Channel::Brightness, 10, &steps),
            Some(ChannelTarget::Brightness(255))
        );
        assert_eq!(
            resolve_target(&state, range, Channel::Saturation, 10, &steps),
            Some(ChannelTarget::Saturation(100.0))
        );
        assert_eq!(
            resolve_target(&state, range, Channel::ColorTemp, 10, &steps),
            Some(ChannelTarget::ColorTemp(500))
        );
        assert_eq!(resolve_target(&state, range, Channel::Power, 1, &steps), None);
    }

    #[test]
    fn test_resolve_burst_capped_brightness() {
        let state = ChannelState::default();
        // 1000 ticks in one event are capped at 20%
        assert_eq!(
            resolve_target(
                &state,
                MiredRange::default(),
                Channel::Brightness,
                1000,
                &StepTable::default()
            ),
            Some(ChannelTarget::Brightness(51))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_coalesces() {
        let scheduler: DebounceScheduler<&'static str, u32> = DebounceScheduler::new();
        let fired = Arc::new(Mutex::new(Vec::new()));

        for value in 1..=5 {
            let fired = fired.clone();
            scheduler.schedule("k", value, Duration::from_millis(250), move |v| async move {
                fired.lock().unwrap().push(v);
            });
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(scheduler.pending(&"k"), Some(5));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*fired.lock().unwrap(), vec![5]);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_keys_are_independent() {
        let scheduler: DebounceScheduler<u8, u8> = DebounceScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        for key in 0..3 {
            let count = count.clone();
            scheduler.schedule(key, key, Duration::from_millis(100), move |_| async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_cancel() {
        let scheduler: DebounceScheduler<(u8, u8), ()> = DebounceScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        for key in [(1, 1), (1, 2), (2, 1)] {
            let count = count.clone();
            scheduler.schedule(key, (), Duration::from_millis(100), move |_| async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(scheduler.cancel_where(|(entity, _)| *entity == 1), 2);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_does_not_abort_running_callback() {
        let scheduler: DebounceScheduler<u8, u8> = DebounceScheduler::new();
        let done = Arc::new(Mutex::new(Vec::new()));

        let d = done.clone();
        scheduler.schedule(0, 1, Duration::from_millis(100), move |v| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            d.lock().unwrap().push(v);
        });

        // First callback is now running its slow part
        tokio::time::sleep(Duration::from_millis(200)).await;

        let d = done.clone();
        scheduler.schedule(0, 2, Duration::from_millis(100), move |v| async move {
            d.lock().unwrap().push(v);
        });

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let mut values = done.lock().unwrap().clone();
        values.sort();
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_cancel_aborts_running_callback() {
        let scheduler: DebounceScheduler<u8, u8> = DebounceScheduler::new();
        let done = Arc::new(Mutex::new(Vec::new()));

        let d = done.clone();
        scheduler.schedule(0, 1, Duration::from_millis(100), move |v| async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            d.lock().unwrap().push(v);
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(scheduler.pending(&0), None);
        assert!(scheduler.any_where(|key| *key == 0));

        assert_eq!(scheduler.cancel_where(|key| *key == 0), 1);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(done.lock().unwrap().is_empty());
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_has_pending_while_dispatching() {
        let cache = seeded_cache("light.a", SnapshotState::default());
        let debouncer = ChannelDebouncer::new(StepTable::default(), Duration::from_millis(250));
        let id = EntityId::new("light.a");

        debouncer.tick(&cache, &id, Channel::Brightness, 5, |_| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(debouncer.pending(&id, Channel::Brightness), None);
        assert!(debouncer.has_pending_for(&id));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!debouncer.has_pending_for(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_tick_is_noop() {
        let cache = EntityStateCache::new(MiredRange::default());
        let debouncer = ChannelDebouncer::new(StepTable::default(), Duration::from_millis(250));
        let id = EntityId::new("light.unknown");

        assert_eq!(debouncer.tick(&cache, &id, Channel::Power, 1, |_| async {}), None);
        assert!(!cache.contains(&id));
        assert_eq!(debouncer.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ticks_keep_latest_target() {
        let cache = seeded_cache("light.a", SnapshotState::default());
        let debouncer = ChannelDebouncer::new(StepTable::default(), Duration::from_secs(60));
        let id = EntityId::new("light.a");
        let handle = tokio::runtime::Handle::current();

        for _ in 0..100 {
            cache.update(&id, |record| record.state.saturation = 0.0);
            let barrier = std::sync::Barrier::new(8);

            std::thread::scope(|s| {
                for _ in 0..8 {
                    s.spawn(|| {
                        let _guard = handle.enter();
                        barrier.wait();
                        for _ in 0..5 {
                            debouncer.tick(&cache, &id, Channel::Saturation, 1, |_| async {});
                        }
                    });
                }
            });

            let saturation = cache.get(&id).saturation;
            assert_eq!(saturation, 40.0);
            assert_eq!(
                debouncer.pending(&id, Channel::Saturation),
                Some(ChannelTarget::Saturation(saturation))
            );
        }

        debouncer.cancel_entity(&id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_is_optimistic_and_coalesced() {
        let cache = seeded_cache(
            "light.a",
            SnapshotState {
                on: Some(false),
                brightness: Some(0),
                ..Default::default()
            },
        );
        let debouncer = ChannelDebouncer::new(StepTable::default(), Duration::from_millis(250));
        let id = EntityId::new("light.a");
        let fired = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..5 {
            let fired = fired.clone();
            debouncer.tick(&cache, &id, Channel::Brightness, 10, move |t| async move {
                fired.lock().unwrap().push(t);
            });
        }

        // Visible before any network activity
        let state = cache.get(&id);
        assert_eq!(state.brightness, 128);
        assert!(state.is_on);
        assert_eq!(
            debouncer.pending(&id, Channel::Brightness),
            Some(ChannelTarget::Brightness(128))
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*fired.lock().unwrap(), vec![ChannelTarget::Brightness(128)]);
        assert_eq!(debouncer.pending(&id, Channel::Brightness), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_capability_denied_is_noop() {
        let cache = EntityStateCache::new(MiredRange::default());
        let debouncer = ChannelDebouncer::new(StepTable::default(), Duration::from_millis(250));
        let id = EntityId::new("light.unknown");

        let target = debouncer.tick(&cache, &id, Channel::Brightness, 3, |_| async {});
        assert_eq!(target, None);
        assert!(!cache.contains(&id));
        assert_eq!(debouncer.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_sets_active_look() {
        let cache = seeded_cache("light.a", SnapshotState::default());
        let debouncer = ChannelDebouncer::new(StepTable::default(), Duration::from_millis(250));
        let id = EntityId::new("light.a");

        debouncer.tick(&cache, &id, Channel::Saturation, 1, |_| async {});
        assert_eq!(cache.record(&id).unwrap().active_look, Some(ActiveLook::Hs));

        debouncer.tick(&cache, &id, Channel::ColorTemp, 1, |_| async {});
        assert_eq!(cache.record(&id).unwrap().active_look, Some(ActiveLook::Temp));

        debouncer.tick(&cache, &id, Channel::Brightness, 1, |_| async {});
        assert_eq!(cache.record(&id).unwrap().active_look, Some(ActiveLook::Temp));

        assert_eq!(debouncer.cancel_entity(&id), 3);
        assert!(!debouncer.has_pending_for(&id));
    }
}
