// Authentication module
// Token persistence, single-flight refresh and the session lifecycle

mod manager;
pub mod refresh;
mod session;
pub mod store;
mod types;

pub use manager::SessionManager;
pub use refresh::{RefreshCoordinator, RefreshPhase};
pub use session::SessionState;
pub use store::{MemoryTokenStore, SqliteTokenStore, TokenStore};
pub use types::{
    CredentialCell, RefreshResponse, Session, TokenPair, UserProfile, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
};

pub(crate) use types::{token_prefix, ErrorBody};
