pub mod block;
pub mod flag;
pub mod request;
