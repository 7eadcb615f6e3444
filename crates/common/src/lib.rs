// cowrite-common: shared types and utilities for the cowrite workspace

pub mod endpoint;
pub mod identity;
pub mod types;

pub use endpoint::{EndpointError, RelayEndpoint};
pub use types::{ConnectionStatus, CursorRange, Participant, ProfilePatch, UserProfile};
