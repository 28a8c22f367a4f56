pub mod anomaly;
pub mod auto_ban;
pub mod blocklist;
pub mod gate;
pub mod geoip;
