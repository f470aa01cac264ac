pub mod config;
pub mod control;
pub mod models;
pub mod monitor;
pub mod plan;
pub mod process;
pub mod reactor;
