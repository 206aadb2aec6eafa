pub mod config;
pub mod error;
pub mod listing;
pub mod logging;
pub mod remote_fs;
pub mod ssh;
pub mod state;

pub use error::{AppError, AppResult};
pub use listing::{EntryKind, FileEntry};
pub use remote_fs::RemoteFs;
pub use state::AppState;
