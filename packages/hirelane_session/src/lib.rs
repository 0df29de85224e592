//! Bearer credential lifecycle and authenticated HTTP session client for Hirelane.

pub mod account;
pub mod client;
pub mod credential;
pub mod error;
mod refresh;
pub mod token_store;

pub use account::{AuthResponse, LoginRequest, RegisterRequest};
pub use client::{ApiRequest, SessionClient, SessionClientBuilder, SessionEvent};
pub use credential::{Credential, CredentialState};
pub use error::{ErrorClass, RefreshError, SessionError};
pub use token_store::TokenStore;
