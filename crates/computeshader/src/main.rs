mod camera;
mod cli;
mod paths;
mod run;
mod scene;
mod seed;
mod watch;

use anyhow::Result;

fn main() -> Result<()> {
    let args = cli::parse();
    run::run(args)
}
