//! Conversation rounds: history, the file-request protocol, and the driver
//! that ties them to prompt assembly.
//!
//! A round starts with a user question and ends with an answer, a reported
//! failure, or an error. In between the model may ask for one file at a
//! time (see [`file_request`]); fetched files live only for the round.
//!
//! - [`history`]: turns, the include/exclude flag, and the same-role collapse.
//! - [`file_request`]: reply parsing and the hop-limited state machine.
//! - [`prompt`]: fixed instruction and acknowledgment texts.
//! - [`events`]: [`EventHandler`] and the events a round emits.
//! - [`guard`]: the busy guard and [`CancellationFlag`].
//! - [`round`]: [`Conversation`], the session object.

pub mod events;
pub mod file_request;
pub mod guard;
pub mod history;
pub mod prompt;
pub mod round;

pub use events::{
    CompositeEventHandler, ConversationEvent, EventHandler, FnEventHandler, LoggingHandler,
    NoopHandler,
};
pub use file_request::{
    DEFAULT_MAX_HOPS, FileRequest, FileRequestMachine, FileRequestState, RoundOutcome,
};
pub use guard::{CancellationFlag, RoundGuard};
pub use history::{HistoryManager, HistorySnapshot, Turn, TurnId, collapse_same_role_runs};
pub use round::{Conversation, FailedFileRequest, RoundReport};
