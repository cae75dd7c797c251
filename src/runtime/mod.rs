pub mod args;
pub mod status;

pub use args::ensure_env_only_invocation;
pub use status::{emit_startup_status, start_status_loop};
