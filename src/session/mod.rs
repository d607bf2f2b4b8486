pub mod client;
pub mod registry;

pub use client::IbSession;
pub use registry::{Completion, PendingRequest, RequestKind, RequestOutcome, RequestRegistry};
