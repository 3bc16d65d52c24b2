//! This module contains utilities for testing code based on the messaging transport: recording
//!  replacements for the socket and the event callbacks, and a configurable application message.
//!  They are used for testing the transport itself, but they are also exported for application
//!  testing.

pub mod events;
pub mod message;
pub mod node;
pub mod sender;
