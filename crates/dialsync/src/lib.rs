pub mod config;
pub mod engine;
pub mod error;
pub mod integrations;

pub use config::Config;
pub use config::LogLevel;
pub use engine::Channel;
pub use engine::Engine;
pub use engine::EngineSettings;
pub use engine::EntityId;
pub use engine::RemoteHub;
pub use engine::UiEvent;
pub use error::ConfigError;
pub use error::DispatchError;
pub use error::HubError;
