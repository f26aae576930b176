//! Network Layer
//!
//! The coordinator link and the bytes that travel over it. This layer is
//! **non-deterministic**; everything that reaches the journal goes through
//! `store/`.

pub mod auth;
pub mod coordinator;
pub mod protocol;
pub mod update;

pub use auth::{AuthProviders, Registration};
pub use coordinator::{
    CoordinatorClient, CoordinatorConfig, CoordinatorError, CoordinatorEvent, CoordinatorHandle,
};
pub use protocol::{FrameBuffer, Inbound, Outbound, ProtocolError, MAX_FRAME_LEN};
pub use update::{CallResult, StateUpdate};
