// Bearer Session - Library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod navigation;

pub use auth::{Session, SessionManager, UserProfile};
pub use error::SessionError;
pub use http_client::{ApiRequest, ApiResponse, AuthClient};
