//! Durable session and transcript state.
//!
//! Sessions map a stable *session key* (`agent:<id>:main`,
//! `agent:<id>:autonomy`, `subagent:<id>:<runid>`, ...) to identity and
//! token counters; transcripts hold the per-session message log with a
//! summarize-and-trim compaction operation. Both survive process restarts.

pub mod store;
pub mod transcript;

pub use store::{SessionEntry, SessionStore};
pub use transcript::{Message, Transcript, TranscriptStore};
