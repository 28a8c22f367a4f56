pub mod alerting;
pub mod retention;
pub mod scheduler;
