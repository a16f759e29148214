pub mod application;
pub mod config;
pub mod infra;
pub mod resources;
pub mod sync;
