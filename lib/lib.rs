pub mod build_info;
pub mod chain_client;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod logging;
pub mod sequence_manager;
pub mod server;
pub mod state;
pub mod sync_service;
