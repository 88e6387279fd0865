pub mod agents;
pub mod commands;
pub mod config;
pub mod errors;
pub mod fs;
pub mod models;
pub mod monitor;
pub mod plan;
pub mod pool;
pub mod process;
pub mod report;
pub mod research;
pub mod resources;
pub mod scheduler;
