// Library modules
pub mod auth;
pub mod carrier;
pub mod client;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod frame;
pub mod registry;
pub mod server;
pub mod session;
pub mod stdio;

// Re-export commonly used types
pub use carrier::{Carrier, CarrierError};
pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use frame::{BeginRequest, BeginResponse, Frame, RelayData, SessionId};
pub use registry::Registry;
pub use server::Server;
pub use session::Session;
