pub mod cancel;
pub mod cli;
pub mod config;
pub mod constants;
pub mod engine;
pub mod remote;
pub mod state;
pub mod topology;
pub mod util;

#[cfg(test)]
pub mod test_support;
