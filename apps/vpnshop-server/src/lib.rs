pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod panel;
pub mod services;
pub mod state;
pub mod worker;
