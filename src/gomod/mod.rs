//! Go module dependencies
//!
//! - `auth`: git credentials for private module hosts
//! - `edit`: go.mod replace and require edits
//! - `fetch`: two-phase download into a shared `/go/pkg/mod` tree

pub mod auth;
pub mod edit;
pub mod fetch;

pub use auth::{gitconfig_script, prepare_auth, secret_env_name, GitAuthConfig, PreparedWorker};
pub use edit::{edit_commands, gomod_edit_script};
pub use fetch::{fetch_all, GOMODCACHE_DIR, GOPATH_DIR, PROXY_CACHE_DIR, PROXY_CACHE_KEY, WORK_DIR};
