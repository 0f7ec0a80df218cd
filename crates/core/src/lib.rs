//! Relay Core Library Crate
//!
//! The session protocol engine and session registry for a telephony voice
//! relay. A connection's text frames are parsed into [`protocol`] messages and
//! dispatched by an [`engine::Engine`] to a [`handler::SessionHandler`]; the
//! [`registry::SessionRegistry`] lets unrelated requests find a live
//! [`session::Session`] again. The transport itself lives outside this crate
//! behind the [`session::Transport`] trait.

pub mod engine;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod session;

pub use engine::{ConnectionState, Engine, OnInitialized, on_initialized};
pub use error::RelayError;
pub use handler::{DefaultHandler, SessionHandler};
pub use protocol::{Extra, InboundMessage, OutboundMessage, SetupMessage};
pub use registry::{KeySource, SessionIdKey, SessionRegistry, derive_key};
pub use session::{Session, SessionInfo, Transport};
