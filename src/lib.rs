pub mod app;
pub mod command;
pub mod config;
pub mod convert;
pub mod decompress;
pub mod domain;
pub mod download;
pub mod error;
pub mod listing;
pub mod organisms;
pub mod output;
pub mod plan;
pub mod pool;
pub mod report;
pub mod resolve;
pub mod store;
pub mod summary;
pub mod tui;
