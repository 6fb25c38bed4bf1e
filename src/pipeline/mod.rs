pub mod backend;
pub mod memory;
pub mod prompt_templates;
pub mod safety; // Input Guard
pub mod stream_guard; // Degeneration watchdog
pub mod streaming;
pub mod types;
pub mod validation;

pub use backend::{BackendError, GenerationBackend, MockBackend};
pub use memory::ConversationMemory;
pub use prompt_templates::{PromptCatalog, PromptLanguage};
pub use safety::{InputGuard, Inspection};
pub use streaming::{ChunkSink, StreamingPipeline};
pub use types::*;
pub use validation::{validate, Verdict};
