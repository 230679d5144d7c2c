pub mod backend;
pub mod error;
pub mod event;
pub mod message;
pub mod passage;
pub mod prompt;
pub mod session;
pub mod snapshot;
pub mod storage;

pub use backend::*;
pub use error::{BackendError, EngineError, ErrorBody};
pub use event::{ArcEventTx, Event, EventTx};
pub use message::{Message, MessageStatus};
pub use passage::Passage;
pub use prompt::{Role, Segment};
pub use session::{Session, SessionState};
pub use snapshot::{MessageSnapshot, SessionSnapshot};
pub use storage::FilterSession;
