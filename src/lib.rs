pub mod broker;
pub mod client;
pub mod config;
pub mod integration;
pub mod logging;
pub mod server;
pub mod shutdown;
pub mod utils;
pub mod wire;
pub mod worker;
