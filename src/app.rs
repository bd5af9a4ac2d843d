use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::sim::kernel::Kernel;

/// Boot the simulator, run the given programs to completion and return
/// the general output log.
pub fn run(config: Config, programs: &[PathBuf]) -> Result<Vec<String>> {
    let kernel = Kernel::boot(config)?;
    for program in programs {
        kernel.admit(program)?;
    }

    let submitted = programs.len() as u32;
    while !kernel.idle(submitted) && !kernel.stopped() {
        thread::sleep(Duration::from_millis(20));
    }

    let output = kernel.output().snapshot();
    kernel.shutdown();
    Ok(output)
}
