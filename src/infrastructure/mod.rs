pub mod gateway_client;
pub mod http_mirror;
