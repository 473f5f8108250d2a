use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::state::EntityId;

/// Tracks when each entity last received a locally-issued command.
///
/// Suppression is entity-wide: any push for an entity within `window` of any
/// command to that entity is dropped, whichever channel it concerns.
#[derive(Debug)]
pub struct EchoSuppressor {
    window: Duration,
    last_command_at: Mutex<HashMap<EntityId, Instant>>,
}

impl EchoSuppressor {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_command_at: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn mark_sent(&self, id: &EntityId) {
        self.last_command_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Instant::now());
    }

    /// Whether a push for `id` arriving now is likely an echo.
    ///
    /// Single-shot: once the window has elapsed the record is forgotten.
    pub fn should_ignore(&self, id: &EntityId) -> bool {
        let mut map = self
            .last_command_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(sent_at) = map.get(id) else {
            return false;
        };

        let elapsed = sent_at.elapsed();
        if elapsed <= self.window {
            trace!("Echo window open for {}: {:?} <= {:?}", id, elapsed, self.window);
            true
        } else {
            map.remove(id);
            false
        }
    }

    pub fn last_command_at(&self, id: &EntityId) -> Option<Instant> {
        self.last_command_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    pub fn clear(&self, id: &EntityId) {
        self.last_command_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}
