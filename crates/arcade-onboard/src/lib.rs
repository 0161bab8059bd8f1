pub mod arbiter;
pub mod archive;
pub mod catalog;
pub mod channel;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod launcher;
pub mod layout;
pub mod lifecycle;
pub mod remote;
pub mod sandbox;

pub use error::{OnboardError, Result};
