//! Authenticate demo for profiledb
//!
//! Registers `udf/profile.udf`, indexes `test.profile(username)`, loads five
//! profiles, then runs a username query and a password-check aggregation.
//! Run: cargo run --bin profiledb   (in another shell)
//!      cargo run --bin authenticate
//! Host, port and the udf directory come from PROFILEDB_* variables or `.env`.

use std::io;

use profiledb::config::Config;
use profiledb::demo::AuthenticateDemo;
use profiledb::logging;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_cli(0);
    let config = Config::from_env()?;

    let mut demo = AuthenticateDemo::connect(&config)?;
    let stdout = io::stdout();
    let outcome = demo.run(&mut stdout.lock());
    demo.teardown()?;
    outcome?;
    Ok(())
}
