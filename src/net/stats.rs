//! Per-server command counters, rendered by the `stats` command.

#[derive(Debug, Default)]
pub struct Stats {
    pub get_cnts: u64,
    pub set_cnts: u64,
    pub del_cnts: u64,
    pub incr_cnts: u64,
    pub decr_cnts: u64,
    pub get_misses: u64,
    pub del_misses: u64,
    pub incr_misses: u64,
    pub decr_misses: u64,
    pub err_cnts: u64,
}
