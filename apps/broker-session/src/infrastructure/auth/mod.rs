//! Broker Authentication
//!
//! OAuth2 token lifecycle: the per-process [`Authenticator`], the
//! cross-process [`TokenCoordinator`], and the local redirect listener used
//! by the interactive authorization-code flow.

mod authenticator;
mod callback;
mod coordinator;
mod error;

pub use authenticator::Authenticator;
pub use callback::{CallbackListener, CallbackParams};
pub use coordinator::TokenCoordinator;
pub use error::{AuthError, TokenError};
