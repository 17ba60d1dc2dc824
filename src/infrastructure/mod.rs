pub mod activity_client;
pub mod cloud_client;
pub mod config;
pub mod error;
pub mod http_client;
pub mod key_value_store;
pub mod month_repository;
pub mod storage;
