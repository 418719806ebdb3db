//! camera-service gateway: a JSON-RPC 2.0 control plane fronting local V4L2
//! camera devices and a media relay.

pub mod auth;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod monitor;
pub mod paths;
pub mod relay;
pub mod rpc;
pub mod session;
pub mod state;

pub use error::{AppError, Result};
