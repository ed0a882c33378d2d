use serde::{Deserialize, Serialize};

/// Per-cache counters, read at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub num_read_hit: u64,
    pub num_read_miss: u64,
    pub num_supply_hit: u64,
    pub num_supply_miss: u64,
    pub num_write_hit: u64,
    pub num_write_miss: u64,
    pub num_upgrade_miss: u64,
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.num_read_hit += other.num_read_hit;
        self.num_read_miss += other.num_read_miss;
        self.num_supply_hit += other.num_supply_hit;
        self.num_supply_miss += other.num_supply_miss;
        self.num_write_hit += other.num_write_hit;
        self.num_write_miss += other.num_write_miss;
        self.num_upgrade_miss += other.num_upgrade_miss;
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "\t# Read    Hits:      {}", self.num_read_hit)?;
        writeln!(f, "\t# Read    Misses:    {}", self.num_read_miss)?;
        writeln!(f, "\t# Supply  Hits:      {}", self.num_supply_hit)?;
        writeln!(f, "\t# Supply  Misses:    {}", self.num_supply_miss)?;
        writeln!(f, "\t# Write   Hits:      {}", self.num_write_hit)?;
        writeln!(f, "\t# Write   Misses:    {}", self.num_write_miss)?;
        write!(f, "\t# Upgrade Misses:    {}", self.num_upgrade_miss)
    }
}
