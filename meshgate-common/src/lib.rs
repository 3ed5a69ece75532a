//! meshgate Common Types
//!
//! Shared types used by the coordination server and device agents.

pub mod key;
pub mod node;
pub mod protocol;
pub mod user;

pub use key::{KeyError, MachineKey, NodeKey};
pub use node::{NewNode, Node, NodeId};
pub use protocol::{
    CreateUserRequest, LoginRequest, LoginResponse, LogoutRequest, SessionEvent,
    SessionEventKind, SessionStatus,
};
pub use user::{NewUser, User, UserId, OIDC_PROVIDER};
