pub mod exchange_client;
pub mod mirror_store;
