use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use strum::IntoEnumIterator;
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::cache::EntityRecord;
use super::cache::EntityStateCache;
use super::color;
use super::color::Rgb;
use super::debounce::ChannelDebouncer;
use super::debounce::StepTable;
use super::debounce::brightness_to_percent;
use super::dispatch::ChannelTarget;
use super::dispatch::CommandDispatcher;
use super::dispatch::DispatchOutcome;
use super::echo::EchoSuppressor;
use super::hub::PushReceiver;
use super::hub::PushSender;
use super::hub::RemoteHub;
use super::message::PushChange;
use super::message::PushUpdate;
use super::message::UiEvent;
use super::preview::ColorPreviewRenderer;
use super::reconcile::ReconcileOutcome;
use super::reconcile::RemoteSyncReconciler;
use super::state::CapabilitySet;
use super::state::Channel;
use super::state::ChannelState;
use super::state::EntityId;
use super::state::MiredRange;
use super::state::WhiteLevels;
use crate::error::DispatchError;
use crate::error::HubError;

/// Capacity for the hub→engine push channel
/// Provides backpressure when the hub pushes faster than the engine can reconcile
const PUSH_CHANNEL_SIZE: usize = 1024;

/// Capacity for UI notifications; slow UI receivers lag rather than block the engine
const UI_CHANNEL_SIZE: usize = 256;

/// Timing and tuning knobs for an [`Engine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Quiet period after the last tick before a channel is dispatched
    pub quiet_period: Duration,

    /// Pushes within this long after a command to the same entity are dropped
    pub echo_window: Duration,

    /// Upper bound for a single hub command
    pub dispatch_timeout: Duration,

    /// Mired bounds for entities that did not report their own
    pub default_range: MiredRange,

    pub steps: StepTable,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(250),
            echo_window: Duration::from_secs(3),
            dispatch_timeout: Duration::from_secs(3),
            default_range: MiredRange::default(),
            steps: StepTable::default(),
        }
    }
}

/// State shared with debounce timer tasks.
#[derive(Debug)]
struct Shared {
    cache: EntityStateCache,
    echo: EchoSuppressor,
    dispatcher: CommandDispatcher,
    reconciler: RemoteSyncReconciler,

    /// Entity whose control view is open, if any
    focus: std::sync::Mutex<Option<EntityId>>,

    ui_tx: broadcast::Sender<UiEvent>,
}

impl Shared {
    fn is_focused(&self, id: &EntityId) -> bool {
        self.focus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            == Some(id)
    }

    fn notify(&self, event: UiEvent) {
        // No receivers is fine; nobody is watching
        let _ = self.ui_tx.send(event);
    }

    /// Dispatch `target`, reporting user-facing failures to the UI once.
    async fn dispatch(
        &self,
        id: &EntityId,
        target: ChannelTarget,
    ) -> Result<DispatchOutcome, DispatchError> {
        let result = self
            .dispatcher
            .dispatch(&self.cache, &self.echo, id, target)
            .await;

        match &result {
            Err(e) if e.is_user_facing() => {
                warn!("Dispatch of {} to {} failed: {}", target.channel(), id, e);
                self.notify(UiEvent::DispatchFailed {
                    entity_id: id.clone(),
                    channel: target.channel(),
                    reason: e.to_string(),
                });
            }
            Err(e) => debug!("Dispatch of {} to {} dropped: {}", target.channel(), id, e),
            Ok(_) => {}
        }

        result
    }
}

/// dialsync engine
///
/// Turns dial ticks into optimistic cache writes and debounced hub commands,
/// and merges pushes from the hub back into the cache without letting echoes
/// of our own commands overwrite newer local values.
#[derive(Debug)]
pub struct Engine {
    shared: Arc<Shared>,

    debouncer: ChannelDebouncer,

    renderer: ColorPreviewRenderer,

    /// Receive pushes from the hub
    push_rx: Mutex<PushReceiver>,

    /// Sender handed to the hub on subscription
    push_tx: PushSender,

    subscribed: AtomicBool,
}

impl Engine {
    pub fn new(hub: Arc<dyn RemoteHub>, settings: EngineSettings) -> Self {
        let (push_tx, push_rx) = mpsc::channel(PUSH_CHANNEL_SIZE);
        let (ui_tx, _) = broadcast::channel(UI_CHANNEL_SIZE);

        let shared = Shared {
            cache: EntityStateCache::new(settings.default_range),
            echo: EchoSuppressor::new(settings.echo_window),
            dispatcher: CommandDispatcher::new(hub, settings.dispatch_timeout),
            reconciler: RemoteSyncReconciler::default(),
            focus: std::sync::Mutex::new(None),
            ui_tx,
        };

        Self {
            shared: Arc::new(shared),
            debouncer: ChannelDebouncer::new(settings.steps, settings.quiet_period),
            renderer: ColorPreviewRenderer::new(),
            push_rx: Mutex::new(push_rx),
            push_tx,
            subscribed: AtomicBool::new(false),
        }
    }

    fn hub(&self) -> &Arc<dyn RemoteHub> {
        self.shared.dispatcher.hub()
    }

    /// Subscribe to hub pushes. Calling this more than once is a no-op.
    pub async fn start(&self) -> Result<(), HubError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            debug!("Already subscribed to {}", self.hub().name());
            return Ok(());
        }

        if let Err(e) = self.hub().subscribe(self.push_tx.clone()).await {
            self.subscribed.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!("Subscribed to push updates from {}", self.hub().name());
        Ok(())
    }

    /// Run the engine's push loop
    ///
    /// Reconciles every push from the hub into the cache.
    pub async fn run(&self) {
        info!("Engine starting");

        let mut rx = self.push_rx.lock().await;
        while let Some(update) = rx.recv().await {
            self.handle_push(&update);
        }

        info!("Engine shutting down");
    }

    /// Reconcile one push and tell the UI if the observed entity changed.
    pub fn handle_push(&self, update: &PushUpdate) -> ReconcileOutcome {
        let shared = &self.shared;
        let outcome = shared
            .reconciler
            .handle(&shared.cache, &shared.echo, update);

        if outcome == ReconcileOutcome::Applied {
            let channels = update.change.channels();
            // The device moved; what we sent last no longer describes it
            shared.dispatcher.forget(&update.entity_id, channels);
            if update.change == PushChange::Power(Some(false)) {
                // Switched off elsewhere: no brightness is confirmed any more
                shared.dispatcher.forget(&update.entity_id, &[Channel::Brightness]);
            }

            if shared.is_focused(&update.entity_id) {
                for channel in channels {
                    shared.notify(UiEvent::ChannelRefreshed {
                        entity_id: update.entity_id.clone(),
                        channel: *channel,
                    });
                }
            }
        }

        outcome
    }

    /// Apply `delta` dial ticks to a channel.
    ///
    /// The cache changes immediately; the hub sees only the final value once
    /// ticks for this channel have been quiet for the debounce period. Returns
    /// the optimistic target, or `None` when the channel is not supported.
    pub fn apply_tick(&self, id: &EntityId, channel: Channel, delta: i32) -> Option<ChannelTarget> {
        let shared = self.shared.clone();
        let entity = id.clone();

        self.debouncer
            .tick(&self.shared.cache, id, channel, delta, move |target| async move {
                let _ = shared.dispatch(&entity, target).await;
            })
    }

    /// Flip the entity on or off right away, without debouncing.
    pub async fn toggle_power(&self, id: &EntityId) -> Result<DispatchOutcome, DispatchError> {
        if !self.shared.cache.capabilities(id).allows(Channel::Power) {
            debug!("Dropping power toggle for {}: capability denied", id);
            return Err(DispatchError::CapabilityDenied(Channel::Power));
        }

        let (on, _) = self.shared.cache.update(id, |record| {
            record.state.is_on = !record.state.is_on;
            record.state.is_on
        });

        info!("Turning {} {}", id, if on { "on" } else { "off" });
        self.shared.dispatch(id, ChannelTarget::Power(on)).await
    }

    /// Set the white levels used when composing RGBW/RGBWW colors.
    ///
    /// Takes effect with the next color dispatch.
    pub fn set_white_levels(&self, id: &EntityId, cold: Option<u8>, warm: Option<u8>) {
        self.shared.cache.update(id, |record| {
            record.white = WhiteLevels { cold, warm };
        });
        debug!("White levels for {}: cold={:?} warm={:?}", id, cold, warm);
    }

    /// Label for a channel of the entity, read straight from the cache.
    pub fn current_display_value(&self, id: &EntityId, channel: Channel) -> String {
        format_display_value(&self.shared.cache.get(id), channel)
    }

    pub fn current_preview_color(&self, id: &EntityId) -> Rgb {
        self.renderer.render(self.shared.cache.record(id).as_ref())
    }

    /// Open the control view of an entity.
    ///
    /// Seeds the cache from bulk discovery the first time; a failed fetch
    /// leaves the entity on conservative defaults.
    pub async fn enter_context(&self, id: &EntityId) {
        let cache = &self.shared.cache;

        if !cache.is_seeded(id) {
            match self.hub().fetch_states().await {
                Ok(snapshots) => {
                    for snapshot in snapshots.iter().filter(|s| !cache.is_seeded(&s.entity_id)) {
                        cache.seed(snapshot);
                    }
                    if !cache.is_seeded(id) {
                        warn!("{} did not report {}", self.hub().name(), id);
                    }
                }
                Err(e) => warn!("Failed to fetch states for {}: {}", id, e),
            }
        }

        // Entries are created on first reference even without a snapshot
        cache.update(id, |_| ());

        *self
            .shared
            .focus
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
        info!("Entered context of {}", id);
    }

    /// Close the control view of an entity.
    ///
    /// Every timer for the entity is cancelled and its LastSent and echo
    /// records dropped, so re-entering starts from a clean slate. Cached
    /// channel values are kept.
    pub fn leave_context(&self, id: &EntityId) {
        let cancelled = self.debouncer.cancel_entity(id);
        self.shared.dispatcher.clear_entity(id);
        self.shared.echo.clear(id);

        let mut focus = self
            .shared
            .focus
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if focus.as_ref() == Some(id) {
            *focus = None;
        }

        info!("Left context of {} ({} timers cancelled)", id, cancelled);
    }

    /// Re-run bulk discovery, e.g. after the hub reconnects.
    ///
    /// Entities with a debounce cycle in flight keep their optimistic values.
    /// Returns how many entities were refreshed.
    pub async fn resync(&self) -> Result<usize, HubError> {
        let snapshots = self.hub().fetch_states().await?;
        let mut refreshed = 0;

        for snapshot in &snapshots {
            let id = &snapshot.entity_id;
            if self.debouncer.has_pending_for(id) {
                debug!("Not resyncing {}: adjustment in progress", id);
                continue;
            }

            self.shared.cache.seed(snapshot);
            self.shared.dispatcher.clear_entity(id);
            refreshed += 1;

            if self.shared.is_focused(id) {
                for channel in Channel::iter() {
                    self.shared.notify(UiEvent::ChannelRefreshed {
                        entity_id: id.clone(),
                        channel,
                    });
                }
            }
        }

        info!("Resynced {} of {} entities", refreshed, snapshots.len());
        Ok(refreshed)
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiEvent> {
        self.shared.ui_tx.subscribe()
    }

    pub fn focused(&self) -> Option<EntityId> {
        self.shared
            .focus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self, id: &EntityId) -> ChannelState {
        self.shared.cache.get(id)
    }

    pub fn record(&self, id: &EntityId) -> Option<EntityRecord> {
        self.shared.cache.record(id)
    }

    pub fn capabilities(&self, id: &EntityId) -> CapabilitySet {
        self.shared.cache.capabilities(id)
    }

    /// Target waiting for its quiet period, if any.
    pub fn pending(&self, id: &EntityId, channel: Channel) -> Option<ChannelTarget> {
        self.debouncer.pending(id, channel)
    }

    pub fn last_sent(&self, id: &EntityId, channel: Channel) -> Option<ChannelTarget> {
        self.shared.dispatcher.last_sent(id, channel)
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.shared.cache.entity_ids()
    }
}

/// "50%", "75%", "180°", "4000K" or "On"/"Off".
pub fn format_display_value(state: &ChannelState, channel: Channel) -> String {
    match channel {
        Channel::Power => if state.is_on { "On" } else { "Off" }.to_string(),
        Channel::Brightness => format!("{}%", brightness_to_percent(state.brightness)),
        Channel::Saturation => format!("{}%", state.saturation.round()),
        Channel::Hue => format!("{}°", state.hue.round() % 360.0),
        Channel::ColorTemp => format!("{}K", color::mired_to_kelvin(state.color_temp_mired)),
    }
}
