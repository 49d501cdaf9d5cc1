// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authsess: client-side auth session manager with single-flight token refresh.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod pipeline;
pub mod run;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod store;
pub mod token;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use coordinator::{LoginPrompt, Navigator, RefreshCoordinator};
pub use error::{ApiError, RefreshFailure, TransportError};
pub use pipeline::ApiClient;
pub use session::{AuthSession, NewUser};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use store::{CredentialStore, Session, TokenPair, User};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
