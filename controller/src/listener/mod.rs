//! The per-deployment listener: configuration, API-token resolution and the
//! poll loop.

pub mod config;
pub mod poller;
pub mod token;

pub use config::ListenerConfig;
pub use poller::Poller;
pub use token::wait_for_api_token;
