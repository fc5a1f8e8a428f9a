pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod connections;
pub mod cost;
pub mod errors;
pub mod executor;
pub mod hooks;
pub mod orchestrator;
pub mod phase;
pub mod recovery;
pub mod spec;
pub mod stream;
pub mod util;

#[cfg(test)]
mod testing;
