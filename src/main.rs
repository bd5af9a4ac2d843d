use std::env;
use std::path::PathBuf;
use std::process;

use ossim::config::Config;
use ossim::{app, logger};

fn main() {
    logger::init();

    let programs: Vec<PathBuf> = env::args().skip(1).map(PathBuf::from).collect();
    if programs.is_empty() {
        eprintln!("usage: ossim <program>...");
        process::exit(1);
    }

    match app::run(Config::default(), &programs) {
        Ok(output) => {
            for line in output {
                println!("{}", line);
            }
        }
        Err(e) => {
            eprintln!("error: {:#}", e);
            process::exit(1);
        }
    }
}
