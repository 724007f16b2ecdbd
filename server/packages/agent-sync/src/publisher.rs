//! Outbound fan-out to subscribers (UIs, API clients).

use std::sync::atomic::{AtomicU64, Ordering};

use schemars::JsonSchema;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{Interaction, Session};
use crate::patch::ContentPatch;

#[derive(Debug, Clone, Serialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberEvent {
    InteractionCreated {
        interaction: Interaction,
    },
    InteractionPatch {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "interactionId")]
        interaction_id: String,
        #[serde(flatten)]
        patch: ContentPatch,
    },
    InteractionCompleted {
        interaction: Interaction,
    },
    SessionUpdated {
        session: Session,
    },
}

impl SubscriberEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::InteractionCreated { interaction } | Self::InteractionCompleted { interaction } => {
                &interaction.session_id
            }
            Self::InteractionPatch { session_id, .. } => session_id,
            Self::SessionUpdated { session } => &session.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InteractionCreated { .. } => "interaction_created",
            Self::InteractionPatch { .. } => "interaction_patch",
            Self::InteractionCompleted { .. } => "interaction_completed",
            Self::SessionUpdated { .. } => "session_updated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SequencedEvent {
    pub sequence: u64,
    pub event: SubscriberEvent,
}

#[derive(Debug)]
pub struct Publisher {
    sender: broadcast::Sender<SequencedEvent>,
    sequence: AtomicU64,
}

impl Publisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencedEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SubscriberEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        // No receivers is not an error: nobody is watching yet.
        let _ = self.sender.send(SequencedEvent { sequence, event });
    }

    pub fn session_updated(&self, session: &Session) {
        self.publish(SubscriberEvent::SessionUpdated {
            session: session.clone(),
        });
    }

    pub fn interaction_created(&self, interaction: &Interaction) {
        self.publish(SubscriberEvent::InteractionCreated {
            interaction: interaction.clone(),
        });
    }

    pub fn interaction_completed(&self, interaction: &Interaction) {
        self.publish(SubscriberEvent::InteractionCompleted {
            interaction: interaction.clone(),
        });
    }

    pub fn interaction_patch(&self, interaction: &Interaction, patch: ContentPatch) {
        self.publish(SubscriberEvent::InteractionPatch {
            session_id: interaction.session_id.clone(),
            interaction_id: interaction.id.clone(),
            patch,
        });
    }
}
