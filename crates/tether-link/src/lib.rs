//! Procedure router, in-process link and the session operations exposed
//! through them.

pub mod client;
pub mod error;
pub mod link;
pub mod local;
pub mod router;
pub mod service;

pub use client::SessionClient;
pub use error::{LinkError, RouterError};
pub use link::{InProcessLink, Link};
pub use local::{LocalLinkSetup, setup_local_link};
pub use router::{OperationDescriptor, OperationKind, Payload, Router};
pub use service::{SessionContext, session_router};
