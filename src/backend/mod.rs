pub mod auth;
pub mod command;
pub mod connection;
pub mod reply;
pub mod tracker;

pub use auth::{AuthState, BackendAuthenticator, EMPTY_PASSWORD_SHA1};
pub use command::BackendCommand;
pub use connection::{BackendConnection, BackendError, BackendSettings, ER_HOST_IS_BLOCKED};
pub use reply::{Reply, ReplyError, ReplyState, TrxState};
pub use tracker::ResponseTracker;
