use std::path::PathBuf;

/// Boot-time configuration for the simulator core.
///
/// Clock rates are in operations per second; the quantum is measured in
/// scheduler ticks of RUNNING time. `swap_dir` and `output_dir` locate
/// the flat swap directory and the per-process output files.
#[derive(Debug, Clone)]
pub struct Config {
    pub page_size: usize,
    pub page_count: usize,
    pub mmu_clock: f64,
    pub scheduler_clock: f64,
    pub cpu_clock: f64,
    pub quantum: u32,
    pub swap_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            page_size: 4,
            page_count: 16,
            mmu_clock: 100.0,
            scheduler_clock: 60.0,
            cpu_clock: 60.0,
            quantum: 5,
            swap_dir: PathBuf::from("swap"),
            output_dir: PathBuf::from("output"),
        }
    }
}

impl Config {
    /// Total number of physical memory cells.
    pub fn total_blocks(&self) -> usize {
        self.page_size * self.page_count
    }
}
