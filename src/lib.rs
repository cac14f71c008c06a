pub mod agent;
pub mod api;
pub mod budget;
pub mod config;
pub mod errors;
pub mod events;
pub mod exec;
pub mod logging;
pub mod merge;
pub mod orchestrator;
pub mod portfolio;
pub mod server;
pub mod shift;
pub mod store;
pub mod util;
pub mod vm;
pub mod work_items;
pub mod workspace;
