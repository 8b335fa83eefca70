//! hookrelay: relay webhooks into disposable `adnanh/webhook` environments.
//!
//! In static mode one Docker environment runs a fixed hooks file for the life
//! of the process. In clone-and-proxy mode each GitHub push gets a fresh
//! environment holding the pushed tree; the request is relayed to it and the
//! environment is torn down once the response has been sent.

pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mode;
pub mod pipeline;
pub mod relay;
pub mod sandbox;
pub mod server;
pub mod source;
pub mod tunnel;
pub mod webhook;
