mod cache;
pub mod color;
mod debounce;
mod dispatch;
mod echo;
#[allow(clippy::module_inception)]
mod engine;
mod hub;
mod message;
mod preview;
mod reconcile;
pub mod state;

pub use cache::EntityRecord;
pub use cache::EntityStateCache;
pub use color::Rgb;
pub use debounce::ChannelDebouncer;
pub use debounce::DebounceScheduler;
pub use debounce::PendingKey;
pub use debounce::StepSize;
pub use debounce::StepTable;
pub use dispatch::ChannelTarget;
pub use dispatch::CommandDispatcher;
pub use dispatch::DispatchOutcome;
pub use echo::EchoSuppressor;
pub use engine::Engine;
pub use engine::EngineSettings;
pub use engine::format_display_value;
pub use hub::EntitySnapshot;
pub use hub::HubCommand;
pub use hub::PushReceiver;
pub use hub::PushSender;
pub use hub::RemoteHub;
pub use hub::SnapshotState;
pub use hub::TurnOnPayload;
pub use message::PushChange;
pub use message::PushUpdate;
pub use message::UiEvent;
pub use preview::ColorPreviewRenderer;
pub use reconcile::ReconcileOutcome;
pub use reconcile::RemoteSyncReconciler;
pub use state::ActiveLook;
pub use state::CapabilitySet;
pub use state::Channel;
pub use state::ChannelState;
pub use state::ColorMode;
pub use state::EntityId;
pub use state::MiredRange;
pub use state::WhiteLevels;
