//! Boot glue. Spawns one worker thread per component, each gated by its
//! configured clock rate, and owns the shutdown flag.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::journal::Journal;

use super::cpu::Cpu;
use super::mailbox::{Addr, Command, Mailbox};
use super::mem::Mmu;
use super::sched::Scheduler;

pub struct Kernel {
    mailbox: Arc<Mailbox>,
    scheduler: Arc<Scheduler>,
    trace: Journal,
    output: Journal,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Kernel {
    /// Wire the components together and start the three worker threads.
    pub fn boot(config: Config) -> Result<Kernel> {
        let trace = Journal::new();
        let output = Journal::new();
        let mailbox = Arc::new(Mailbox::new(Journal::new()));
        let swap_lock = Arc::new(Mutex::new(()));
        let swappable = Arc::new(Mutex::new(Vec::new()));

        let scheduler = Arc::new(Scheduler::new(
            mailbox.clone(),
            output.clone(),
            config.quantum,
            swap_lock.clone(),
            swappable.clone(),
        ));
        let mut mmu = Mmu::new(
            config.page_size,
            config.page_count,
            config.swap_dir.clone(),
            mailbox.clone(),
            output.clone(),
            swap_lock,
            swappable,
        );
        let mut cpu = Cpu::new(
            scheduler.clone(),
            mailbox.clone(),
            trace.clone(),
            output.clone(),
            config.output_dir.clone(),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();

        {
            let stop = stop.clone();
            let scheduler = scheduler.clone();
            let period = tick_period(config.scheduler_clock);
            workers.push(
                thread::Builder::new()
                    .name("scheduler".to_string())
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            scheduler.tick();
                            thread::sleep(period);
                        }
                    })
                    .context("spawning scheduler thread")?,
            );
        }
        {
            let stop = stop.clone();
            let fatal = output.clone();
            let period = tick_period(config.mmu_clock);
            workers.push(
                thread::Builder::new()
                    .name("mmu".to_string())
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            if let Err(e) = mmu.tick() {
                                fatal.append(format!("[MMU/FATAL] {:#}", e));
                                log::error!("mmu fatal, stopping simulator: {:#}", e);
                                stop.store(true, Ordering::Relaxed);
                                break;
                            }
                            thread::sleep(period);
                        }
                    })
                    .context("spawning mmu thread")?,
            );
        }
        {
            let stop = stop.clone();
            let period = tick_period(config.cpu_clock);
            workers.push(
                thread::Builder::new()
                    .name("cpu".to_string())
                    .spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            cpu.tick();
                            thread::sleep(period);
                        }
                    })
                    .context("spawning cpu thread")?,
            );
        }

        log::info!(
            "booted: {} pages of {} blocks, quantum {}",
            config.page_count,
            config.page_size,
            config.quantum
        );
        Ok(Kernel {
            mailbox,
            scheduler,
            trace,
            output,
            stop,
            workers,
        })
    }

    /// Submit a program for admission. The scheduler picks it up on its
    /// next tick.
    pub fn admit<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let src = fs::read_to_string(path)
            .with_context(|| format!("reading program {}", path.display()))?;
        let code_length = src.lines().count();
        self.mailbox.put(
            Addr::Scheduler,
            Addr::Scheduler,
            Command::Admit {
                path: path.to_path_buf(),
                code_length,
            },
        );
        log::info!("submitted {} ({} lines)", path.display(), code_length);
        Ok(())
    }

    /// True once every submitted program has been admitted and reaped.
    pub fn idle(&self, submitted: u32) -> bool {
        self.scheduler.admitted() >= submitted && self.scheduler.live() == 0
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn trace(&self) -> &Journal {
        &self.trace
    }

    pub fn output(&self) -> &Journal {
        &self.output
    }

    pub fn mailbox_log(&self) -> &Journal {
        self.mailbox.log()
    }

    /// Stop all worker threads and wait for them to exit.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        log::info!("shut down");
    }
}

fn tick_period(rate: f64) -> Duration {
    if rate > 0.0 {
        Duration::from_secs_f64(1.0 / rate)
    } else {
        Duration::from_millis(1)
    }
}
