//! eddy-wire: wire model and HTTP client for eddy
//!
//! This crate owns the canonical message/step types, the normalization of
//! loosely-typed server frames into those types, and the REST + server-sent
//! events client used to talk to the conversation backend.

pub mod client;
pub mod error;
pub mod event;
pub mod types;

pub use client::{AgentProfile, ApiClient, Page, SummaryResponse};
pub use error::{Error, Result};
pub use event::{RawFrame, StreamChunk, StreamDone, StreamEvent, normalize};
pub use types::*;
