use std::sync::Arc;

use crate::types::{ChatMessage, Role, serialize_conversation};

use super::GatewayError;
use super::tamper_log::TamperStore;

/// Rejects conversations containing assistant turns this gateway never produced.
#[derive(Clone)]
pub struct ConversationValidator {
    store: Arc<dyn TamperStore>,
}

impl std::fmt::Debug for ConversationValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationValidator").finish_non_exhaustive()
    }
}

impl ConversationValidator {
    pub fn new(store: Arc<dyn TamperStore>) -> Self {
        Self { store }
    }

    /// Every assistant message must close a prefix previously logged for this key and persona.
    ///
    /// Fails on the first prefix that is missing from the tamper log.
    pub async fn validate(
        &self,
        key_id: &str,
        persona: &str,
        messages: &[ChatMessage],
    ) -> Result<(), GatewayError> {
        for (idx, message) in messages.iter().enumerate() {
            if message.role != Role::Assistant {
                continue;
            }

            let prefix =
                serialize_conversation(&messages[..=idx]).map_err(GatewayError::internal)?;
            if !self.store.exists(key_id, persona, &prefix).await? {
                tracing::warn!(
                    key_id,
                    persona,
                    message_index = idx,
                    "rejecting conversation with unlogged assistant turn"
                );
                return Err(GatewayError::TamperedHistory);
            }
        }
        Ok(())
    }
}
