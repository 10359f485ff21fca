pub mod batch;
pub mod config;
pub mod disk_sizing;
pub mod fleet;
pub mod framerate;
pub mod log_monitor;
pub mod log_parser;
pub mod logger;
pub mod media;
pub mod offer_catalog;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;
pub mod provider_manager;
pub mod retry;
pub mod state_machine;
pub mod toolkit;
pub mod transfer;
pub mod upload_ledger;
