//! Round Table persona gateway: an OpenAI-compatible chat endpoint that serves fixed personas
//! on top of a single upstream provider, with per-key budgets and a tamper log of the
//! conversations it produced.

mod error;

pub mod gateway;
pub mod model;
pub mod providers;
pub mod types;
pub mod utils;

pub use error::{Result, RoundtableError};
pub use model::{ChatUpstream, ChunkStream};
pub use providers::OpenAiCompatibleUpstream;
pub use types::{ChatMessage, FinishReason, Role, UpstreamChunk};
