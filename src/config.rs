use clap::Parser;
use std::path::PathBuf;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_AOF_PATH: &str = "database.aof";

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// The address to bind to
    #[arg(long, env = "TINYREDIS_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// The port to listen on
    #[arg(short, long, env = "TINYREDIS_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Path of the append-only file, created if it does not exist
    #[arg(long = "aof", env = "TINYREDIS_AOF", default_value = DEFAULT_AOF_PATH)]
    pub aof_path: PathBuf,

    /// Largest request accepted from a client, in bytes
    #[arg(long, env = "TINYREDIS_MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            aof_path: PathBuf::from(DEFAULT_AOF_PATH),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
