//! Suspension: pause a turn until a human answers, then resume it in place.
//!
//! - [`store::SuspensionStore`]: registry of pending question groups with a
//!   one-shot wait handle per group. Submitting responses wakes exactly that
//!   group's waiter. Groups can be cancelled explicitly or expire through a
//!   TTL sweep.
//! - [`ask_user_tool::AskUserTool`]: the LLM-callable tool that raises a
//!   group from inside a running turn.
//! - [`extract`]: restates prose questions as a structured list.
//!
//! The store is in-process. Run one worker, or route respond requests to the
//! worker that owns the turn.

pub mod ask_user_tool;
pub mod extract;
pub mod question;
pub mod store;

pub use ask_user_tool::AskUserTool;
pub use extract::{ExtractError, LlmQuestionExtractor, QuestionExtractor};
pub use question::{QuestionInput, QuestionItem, QuestionKind, Responses};
pub use store::{
    PendingQuestionGroup, QuestionGroupHandle, QuestionWaiter, SubmitOutcome, SuspensionStore,
    WaitError,
};
