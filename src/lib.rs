pub mod analyze;
pub mod auth;
pub mod broker;
pub mod cli;
pub mod config;
pub mod data;
pub mod download;
