//! 会话层：誊本 arena、会话状态、检查点后端与主体级长期事实

pub mod facts;
pub mod manager;
pub mod state;
pub mod transcript;

pub use facts::FactsStore;
pub use manager::{
    create_session_backend, FileSessionBackend, MemorySessionBackend, SessionBackend,
    SessionStateManager,
};
pub use state::{ReviewStatus, SessionState};
pub use transcript::{Message, Role, Transcript};
