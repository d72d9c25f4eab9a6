//! Runtime configuration: pool sizing, tick cadence, and the local listen
//! port used to recognize (and skip) ourselves in tracker peer lists,
//! rather than relying on any hard-coded port value.
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Maximum number of concurrently connected peers.
    #[arg(long, default_value_t = 5)]
    pub pool_capacity: usize,

    /// Seconds between manager ticks (eviction, selection, completion).
    #[arg(long, default_value_t = 5)]
    pub tick_interval_secs: u64,

    /// Seconds between tracker polls, used until the tracker's own
    /// `interval` has been observed in a response.
    #[arg(long, default_value_t = 30)]
    pub tracker_poll_interval_secs: u64,

    /// Directory piece segments are written under.
    #[arg(long, default_value = "./downloads")]
    pub base_dir: PathBuf,

    /// This client's own listen port, used to recognize ourselves in
    /// tracker peer lists during pool top-up.
    #[arg(long, default_value_t = 6881)]
    pub listen_port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pool_capacity: usize,
    pub tick_interval: Duration,
    pub tracker_poll_interval: Duration,
    pub base_dir: PathBuf,
    pub listen_port: u16,
}

impl From<ConfigArgs> for Config {
    fn from(args: ConfigArgs) -> Self {
        Config {
            pool_capacity: args.pool_capacity,
            tick_interval: Duration::from_secs(args.tick_interval_secs),
            tracker_poll_interval: Duration::from_secs(args.tracker_poll_interval_secs),
            base_dir: args.base_dir,
            listen_port: args.listen_port,
        }
    }
}
