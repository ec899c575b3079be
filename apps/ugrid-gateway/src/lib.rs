pub mod alerts;
pub mod cli;
pub mod codec;
pub mod config;
pub mod control;
pub mod device;
pub mod economics;
pub mod error;
pub mod poll;
pub mod routes;
pub mod state;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
