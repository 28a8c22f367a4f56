pub mod http_handler;
pub mod server;
