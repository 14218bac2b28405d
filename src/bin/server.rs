use clap::Parser;
use tinyredis::config::Config;
use tinyredis::{server, Error};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::parse();

    server::run(config).await
}
