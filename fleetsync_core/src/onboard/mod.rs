pub mod config;
pub mod discovery;
pub mod memory;
pub mod models;
pub mod mongo;
pub mod postgres;
pub mod redis;
pub mod secrets;
pub mod traits;
