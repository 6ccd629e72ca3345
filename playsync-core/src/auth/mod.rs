//! OAuth login
//!
//! Authorization-code flow with PKCE. The implicit grant is not supported.

mod flow;
pub mod pkce;

pub use flow::{AuthFlow, AuthState};
