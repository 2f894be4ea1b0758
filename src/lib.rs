pub mod backend;
pub mod config;
pub mod controller;
pub mod engine;
pub mod errors;
pub mod prompting;
pub mod protocol;
pub mod server;
pub mod session;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
