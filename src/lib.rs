pub mod classifier;
pub mod cli;
pub mod clock;
pub mod controller;
pub mod daemon;
pub mod errors;
pub mod migrate;
pub mod models;
pub mod poller;
pub mod provider;
pub mod server;
pub mod storage;
