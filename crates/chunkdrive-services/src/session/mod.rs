//! Upload sessions and their cleanup.

mod reaper;
mod store;

pub use reaper::UploadReaper;
pub use store::{session_key, NewSession, SessionStore};
