use crate::Time;
use serde::{Deserialize, Serialize};

/// Sentinel for "no next-level cache" on the snoop bus.
pub const NO_NEXT_LEVEL: &str = "NONE";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{0} must be > 0")]
    MissingParam(&'static str),
    #[error("{param} must be a power of two (got {value})")]
    NotPowerOfTwo { param: &'static str, value: usize },
    #[error("bad latency {0:?} (expected \"<number> <ps|ns|us|ms>\")")]
    BadLatency(String),
}

/// Construction parameters for a cache component.
///
/// `num_rows` and `blocksize` must be powers of two: row and tag bits are
/// carved directly out of the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub num_ways: usize,
    pub num_rows: usize,
    pub blocksize: usize,
    /// Number of upstream peer links (`upstream0`, `upstream1`, ...).
    #[serde(default)]
    pub num_upstream: usize,
    /// Destination name stamped on snoop-bus data requests, or `"NONE"`.
    #[serde(default = "default_next_level")]
    pub next_level_name: String,
    /// Latency of the self link, e.g. `"10 ns"`.
    pub access_time: String,
    /// Start a speculative fill when a peer request misses here even though
    /// it was not addressed to us.
    #[serde(default = "default_prefetch")]
    pub prefetch_peer_misses: bool,
}

fn default_next_level() -> String {
    NO_NEXT_LEVEL.to_string()
}

fn default_prefetch() -> bool {
    true
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_ways == 0 {
            return Err(Error::MissingParam("num_ways"));
        }
        if self.num_rows == 0 {
            return Err(Error::MissingParam("num_rows"));
        }
        if self.blocksize == 0 {
            return Err(Error::MissingParam("blocksize"));
        }
        if !self.num_rows.is_power_of_two() {
            return Err(Error::NotPowerOfTwo {
                param: "num_rows",
                value: self.num_rows,
            });
        }
        if !self.blocksize.is_power_of_two() {
            return Err(Error::NotPowerOfTwo {
                param: "blocksize",
                value: self.blocksize,
            });
        }
        parse_latency(&self.access_time)?;
        Ok(())
    }

    /// The self-link latency, in picoseconds.
    pub fn access_latency(&self) -> Result<Time, Error> {
        parse_latency(&self.access_time)
    }

    pub fn next_level(&self) -> Option<&str> {
        if self.next_level_name == NO_NEXT_LEVEL {
            None
        } else {
            Some(&self.next_level_name)
        }
    }
}

/// Parse an SST-style latency string (`"50 ps"`, `"2 ns"`) into picoseconds.
pub fn parse_latency(value: &str) -> Result<Time, Error> {
    let bad = || Error::BadLatency(value.to_string());
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(bad)?;
    let (digits, unit) = trimmed.split_at(split);
    let count: Time = digits.parse().map_err(|_| bad())?;
    let scale = match unit.trim() {
        "ps" => 1,
        "ns" => 1_000,
        "us" => 1_000_000,
        "ms" => 1_000_000_000,
        _ => return Err(bad()),
    };
    Ok(count * scale)
}

#[cfg(test)]
mod tests {
    use super::{parse_latency, Config, Error};

    fn base() -> Config {
        Config {
            num_ways: 2,
            num_rows: 16,
            blocksize: 64,
            num_upstream: 1,
            next_level_name: super::NO_NEXT_LEVEL.to_string(),
            access_time: "10 ns".to_string(),
            prefetch_peer_misses: true,
        }
    }

    #[test]
    fn valid_config() {
        assert_eq!(base().validate(), Ok(()));
    }

    #[test]
    fn zero_params_rejected() {
        for param in ["num_ways", "num_rows", "blocksize"] {
            let mut config = base();
            match param {
                "num_ways" => config.num_ways = 0,
                "num_rows" => config.num_rows = 0,
                _ => config.blocksize = 0,
            }
            assert_eq!(config.validate(), Err(Error::MissingParam(param)));
        }
    }

    #[test]
    fn non_power_of_two_rejected() {
        let mut config = base();
        config.num_rows = 24;
        assert_eq!(
            config.validate(),
            Err(Error::NotPowerOfTwo {
                param: "num_rows",
                value: 24
            })
        );
    }

    #[test]
    fn latency_units() {
        assert_eq!(parse_latency("50 ps"), Ok(50));
        assert_eq!(parse_latency("2 ns"), Ok(2_000));
        assert_eq!(parse_latency("1us"), Ok(1_000_000));
        assert_eq!(parse_latency("3 ms"), Ok(3_000_000_000));
        assert!(parse_latency("fast").is_err());
        assert!(parse_latency("10 parsec").is_err());
        assert!(parse_latency("").is_err());
    }

    #[test]
    fn next_level_sentinel() {
        let mut config = base();
        assert_eq!(config.next_level(), None);
        config.next_level_name = "l2".to_string();
        assert_eq!(config.next_level(), Some("l2"));
    }
}
