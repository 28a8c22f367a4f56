use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest path stored on a request record; longer paths are truncated.
pub const MAX_PATH_LEN: usize = 2048;

/// Resolved location of a public address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub city: Option<String>,
}

/// One admitted request, as written to the log store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub address: IpAddr,
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub country: Option<String>,
    pub city: Option<String>,
}

impl RequestRecord {
    pub fn new(address: IpAddr, path: &str, location: Option<Location>) -> Self {
        Self::at(address, path, location, Utc::now())
    }

    /// Build a record with an explicit timestamp.
    pub fn at(
        address: IpAddr,
        path: &str,
        location: Option<Location>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let (country, city) = match location {
            Some(loc) => (loc.country, loc.city),
            None => (None, None),
        };
        Self {
            address,
            timestamp,
            path: bounded_path(path, MAX_PATH_LEN),
            country,
            city,
        }
    }
}

/// Truncate `path` to at most `max` bytes on a char boundary.
pub fn bounded_path(path: &str, max: usize) -> String {
    if path.len() <= max {
        return path.to_string();
    }
    let mut end = max;
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    path[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_path_is_truncated() {
        let path = format!("/{}", "a".repeat(3000));
        let record = RequestRecord::new("8.8.8.8".parse().unwrap(), &path, None);
        assert_eq!(record.path.len(), MAX_PATH_LEN);
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        // "é" is two bytes; a cut at 2 would split it.
        let out = bounded_path("/éé", 2);
        assert_eq!(out, "/");
    }

    #[test]
    fn test_location_is_split_into_columns() {
        let loc = Location {
            country: Some("Germany".into()),
            city: Some("Berlin".into()),
        };
        let record = RequestRecord::new("1.2.3.4".parse().unwrap(), "/", Some(loc));
        assert_eq!(record.country.as_deref(), Some("Germany"));
        assert_eq!(record.city.as_deref(), Some("Berlin"));
    }
}
