pub mod allocator;
pub mod analytics;
pub mod api;
pub mod codec;
pub mod config;
pub mod models;
pub mod redirect;
pub mod storage;
pub mod token;
