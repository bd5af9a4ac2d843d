//! Memory management unit.
//!
//! Maintains a flat array of string cells representing physical memory
//! and allocates frames to processes through a paging system. When no
//! free frame is left, victims from the scheduler's swappable list are
//! written out to text files under the swap directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::journal::Journal;

use super::mailbox::{Addr, Command, Mailbox};
use super::pcb::Pid;

/// Verdict of an allocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    Success,
    NoFreeFrames,
    ExceedsCapacity,
}

pub struct Mmu {
    ram: Vec<Option<String>>,
    page_size: usize,
    page_count: usize,
    /// For each PID, page index to frame offset.
    page_table: BTreeMap<Pid, BTreeMap<usize, usize>>,
    /// Frame offset to in-use flag, iterated in ascending offset order.
    frames: BTreeMap<usize, bool>,
    mailbox: Arc<Mailbox>,
    log: Journal,
    swap_lock: Arc<Mutex<()>>,
    swappable: Arc<Mutex<Vec<Pid>>>,
    swap_dir: PathBuf,
}

impl Mmu {
    pub fn new(
        page_size: usize,
        page_count: usize,
        swap_dir: PathBuf,
        mailbox: Arc<Mailbox>,
        log: Journal,
        swap_lock: Arc<Mutex<()>>,
        swappable: Arc<Mutex<Vec<Pid>>>,
    ) -> Mmu {
        let mut frames = BTreeMap::new();
        for page in 0..page_count {
            frames.insert(page * page_size, false);
        }
        Mmu {
            ram: vec![None; page_size * page_count],
            page_size,
            page_count,
            page_table: BTreeMap::new(),
            frames,
            mailbox,
            log,
            swap_lock,
            swappable,
            swap_dir,
        }
    }

    /// Serve at most one request. Returns an error only on swap-file
    /// I/O failure, which is fatal to the simulator.
    pub fn tick(&mut self) -> Result<()> {
        let Some(message) = self.mailbox.get(Addr::Mmu) else {
            return Ok(());
        };
        let sender = message.sender;
        match message.command {
            Command::Allocate {
                pid,
                blocks,
                loading,
            } => self.handle_allocate(pid, blocks, loading)?,
            Command::Free { pid, blocks } => self.handle_free(pid, blocks),
            Command::SwapIn { pid } => self.handle_swap_in(pid)?,
            Command::Read { pid, addr, last } => self.handle_read(pid, addr, last, sender),
            Command::Write {
                pid,
                addr,
                data,
                last,
            } => self.handle_write(pid, addr, data, last),
            Command::Drop { pid } => self.handle_drop(pid),
            _ => {}
        }
        Ok(())
    }

    fn handle_allocate(&mut self, pid: Pid, blocks: usize, loading: bool) -> Result<()> {
        let swap_lock = self.swap_lock.clone();
        let swappable = self.swappable.clone();
        let mut swap_guard = None;
        let mut victim_index = 0;
        loop {
            match self.allocate(pid, blocks) {
                AllocOutcome::Success => {
                    let reply = if loading {
                        Command::Allocated { pid }
                    } else {
                        Command::Unblock { pid }
                    };
                    self.mailbox.put(Addr::Mmu, Addr::Scheduler, reply);
                    self.log
                        .append(format!("[MMU] Allocated {} blocks to PID {}", blocks, pid));
                    break;
                }
                AllocOutcome::NoFreeFrames => {
                    // The lock is taken once for the whole victim sweep
                    // and keeps the scheduler from advancing meanwhile.
                    if swap_guard.is_none() {
                        swap_guard = Some(swap_lock.lock().unwrap());
                    }
                    let victim = swappable.lock().unwrap().get(victim_index).copied();
                    match victim {
                        Some(victim) => {
                            self.swap_out(victim)?;
                            victim_index += 1;
                            self.mailbox
                                .put(Addr::Mmu, Addr::Scheduler, Command::SwappedOut { pid: victim });
                            self.log.append(format!("[MMU] Swapped out PID {}", victim));
                        }
                        None => {
                            self.mailbox
                                .put(Addr::Mmu, Addr::Scheduler, Command::Skip { pid });
                            self.log.append(format!(
                                "[MMU] Could not swap out enough processes to allocate for PID {}, skipping",
                                pid
                            ));
                            break;
                        }
                    }
                }
                AllocOutcome::ExceedsCapacity => {
                    self.mailbox
                        .put(Addr::Mmu, Addr::Scheduler, Command::Drop { pid });
                    self.log
                        .append(format!("[MMU/ERROR] Out of memory for PID {}", pid));
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_free(&mut self, pid: Pid, blocks: usize) {
        if self.free(pid, blocks) {
            self.log
                .append(format!("[MMU] Freed {} blocks from PID {}", blocks, pid));
        } else {
            self.mailbox
                .put(Addr::Mmu, Addr::Scheduler, Command::Drop { pid });
            self.log.append(format!(
                "[MMU/ERROR] PID {} attempted to free more memory than allocated to it",
                pid
            ));
        }
    }

    fn handle_swap_in(&mut self, pid: Pid) -> Result<()> {
        if self.swap_in(pid)? {
            self.mailbox
                .put(Addr::Mmu, Addr::Scheduler, Command::SwappedIn { pid });
            self.log.append(format!("[MMU] Swapped in PID {}", pid));
        } else {
            self.mailbox
                .put(Addr::Mmu, Addr::Scheduler, Command::Skip { pid });
            self.log.append(format!(
                "[MMU] Not enough free memory to swap in PID {}, skipping",
                pid
            ));
        }
        Ok(())
    }

    fn handle_read(&mut self, pid: Pid, addr: usize, last: bool, sender: Addr) {
        match self.read(pid, addr) {
            Some(value) => {
                self.mailbox.put(
                    Addr::Mmu,
                    sender,
                    Command::Data {
                        value: value.clone(),
                        last,
                    },
                );
                if last {
                    self.mailbox
                        .put(Addr::Mmu, Addr::Scheduler, Command::Unblock { pid });
                }
                self.log.append(format!(
                    "[MMU] Read '{}' from virtual address {} for PID {}",
                    value, addr, pid
                ));
            }
            None => {
                self.mailbox
                    .put(Addr::Mmu, Addr::Scheduler, Command::Drop { pid });
                self.log.append(format!(
                    "[MMU/ERROR] PID {} attempted to read from an invalid address",
                    pid
                ));
            }
        }
    }

    fn handle_write(&mut self, pid: Pid, addr: usize, data: String, last: bool) {
        let logged = format!(
            "[MMU] Wrote '{}' to virtual address {} for PID {}",
            data, addr, pid
        );
        if self.write(pid, addr, data) {
            if last {
                self.mailbox
                    .put(Addr::Mmu, Addr::Scheduler, Command::Unblock { pid });
            }
            self.log.append(logged);
        } else {
            self.mailbox
                .put(Addr::Mmu, Addr::Scheduler, Command::Drop { pid });
            self.log.append(format!(
                "[MMU/ERROR] PID {} attempted to write to an invalid address",
                pid
            ));
        }
    }

    fn handle_drop(&mut self, pid: Pid) {
        let blocks = self.pages_of(pid) * self.page_size;
        self.free(pid, blocks);
        self.page_table.remove(&pid);
        let _ = fs::remove_file(self.swap_path(pid));
        self.log.append(format!("[MMU] Dropped PID {}", pid));
    }

    /// Read the cell at a virtual address. `None` when the page is not
    /// mapped or the cell was never written.
    fn read(&self, pid: Pid, addr: usize) -> Option<String> {
        let page = addr / self.page_size;
        let offset = addr % self.page_size;
        let frame = *self.page_table.get(&pid)?.get(&page)?;
        self.ram[frame + offset].clone()
    }

    fn write(&mut self, pid: Pid, addr: usize, data: String) -> bool {
        let page = addr / self.page_size;
        let offset = addr % self.page_size;
        match self.page_table.get(&pid).and_then(|table| table.get(&page)) {
            Some(&frame) => {
                self.ram[frame + offset] = Some(data);
                true
            }
            None => false,
        }
    }

    /// Assign free frames to successive page slots, scanning the frame
    /// table in ascending offset order.
    fn allocate(&mut self, pid: Pid, blocks: usize) -> AllocOutcome {
        let pages = Self::pages_for(blocks, self.page_size);
        let held = self.pages_of(pid);
        if pages + held > self.page_count {
            return AllocOutcome::ExceedsCapacity;
        }
        let free: Vec<usize> = self
            .frames
            .iter()
            .filter(|(_, used)| !**used)
            .map(|(offset, _)| *offset)
            .collect();
        if free.len() < pages {
            return AllocOutcome::NoFreeFrames;
        }
        for (slot, offset) in free.into_iter().take(pages).enumerate() {
            self.frames.insert(offset, true);
            self.page_table
                .entry(pid)
                .or_default()
                .insert(held + slot, offset);
        }
        AllocOutcome::Success
    }

    /// Free pages from the highest page index downward, clearing each
    /// cell before the frame goes back to the pool. False when the
    /// process holds fewer pages than requested.
    fn free(&mut self, pid: Pid, blocks: usize) -> bool {
        let pages = Self::pages_for(blocks, self.page_size);
        let Some(table) = self.page_table.get_mut(&pid) else {
            return false;
        };
        if table.len() < pages {
            return false;
        }
        let held = table.len();
        for i in 1..=pages {
            if let Some(offset) = table.remove(&(held - i)) {
                for cell in 0..self.page_size {
                    self.ram[offset + cell] = None;
                }
                self.frames.insert(offset, false);
            }
        }
        true
    }

    /// Write every mapped page of a process out to its swap file, one
    /// cell per line, then free all its frames. I/O failure is fatal.
    fn swap_out(&mut self, pid: Pid) -> Result<()> {
        fs::create_dir_all(&self.swap_dir)
            .with_context(|| format!("swapping out PID {}: cannot create swap directory", pid))?;
        let mut contents = String::new();
        if let Some(table) = self.page_table.get(&pid) {
            for frame in table.values() {
                for cell in 0..self.page_size {
                    if let Some(value) = &self.ram[frame + cell] {
                        contents.push_str(value);
                    }
                    contents.push('\n');
                }
            }
        }
        fs::write(self.swap_path(pid), contents)
            .with_context(|| format!("swapping out PID {} failed", pid))?;
        let blocks = self.pages_of(pid) * self.page_size;
        self.free(pid, blocks);
        Ok(())
    }

    /// Restore a process from its swap file. Values are written back to
    /// contiguous virtual addresses starting at 0, regardless of their
    /// original page layout. False when allocation fails.
    fn swap_in(&mut self, pid: Pid) -> Result<bool> {
        let text = fs::read_to_string(self.swap_path(pid))
            .with_context(|| format!("swapping in PID {} failed", pid))?;
        let blocks = text.lines().count();
        if self.allocate(pid, blocks) != AllocOutcome::Success {
            return Ok(false);
        }
        for (addr, line) in text.lines().enumerate() {
            if !line.trim().is_empty() {
                self.write(pid, addr, line.to_string());
            }
        }
        Ok(true)
    }

    fn swap_path(&self, pid: Pid) -> PathBuf {
        self.swap_dir.join(format!("{}.txt", pid))
    }

    fn pages_for(blocks: usize, page_size: usize) -> usize {
        (blocks + page_size - 1) / page_size
    }

    /// Number of pages currently mapped for a PID.
    pub fn pages_of(&self, pid: Pid) -> usize {
        self.page_table.get(&pid).map_or(0, |table| table.len())
    }

    /// Number of frames currently marked in use.
    pub fn frames_in_use(&self) -> usize {
        self.frames.values().filter(|used| **used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PAGE_SIZE: usize = 2;
    const PAGE_COUNT: usize = 4;

    fn temp_swap_dir() -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let dir = std::env::temp_dir().join(format!(
            "ossim-mmu-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct Rig {
        mmu: Mmu,
        mailbox: Arc<Mailbox>,
        log: Journal,
        swappable: Arc<Mutex<Vec<Pid>>>,
    }

    fn rig() -> Rig {
        let log = Journal::new();
        let mailbox = Arc::new(Mailbox::new(Journal::new()));
        let swap_lock = Arc::new(Mutex::new(()));
        let swappable = Arc::new(Mutex::new(Vec::new()));
        let mmu = Mmu::new(
            PAGE_SIZE,
            PAGE_COUNT,
            temp_swap_dir(),
            mailbox.clone(),
            log.clone(),
            swap_lock,
            swappable.clone(),
        );
        Rig {
            mmu,
            mailbox,
            log,
            swappable,
        }
    }

    fn send(rig: &mut Rig, sender: Addr, command: Command) {
        rig.mailbox.put(sender, Addr::Mmu, command);
        rig.mmu.tick().unwrap();
    }

    fn scheduler_reply(rig: &Rig) -> Command {
        rig.mailbox.get(Addr::Scheduler).expect("reply").command
    }

    #[test]
    fn allocate_and_free_restore_frame_record() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Allocate {
                pid: 1,
                blocks: 3,
                loading: true,
            },
        );
        assert_eq!(Command::Allocated { pid: 1 }, scheduler_reply(&rig));
        assert_eq!(2, rig.mmu.pages_of(1));
        assert_eq!(2, rig.mmu.frames_in_use());

        send(&mut rig, Addr::Cpu, Command::Free { pid: 1, blocks: 3 });
        assert_eq!(0, rig.mmu.pages_of(1));
        assert_eq!(0, rig.mmu.frames_in_use());
        assert!(rig.log.contains("[MMU] Freed 3 blocks from PID 1"));
    }

    #[test]
    fn allocate_zero_blocks_is_noop_success() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Cpu,
            Command::Allocate {
                pid: 1,
                blocks: 0,
                loading: false,
            },
        );
        assert_eq!(Command::Unblock { pid: 1 }, scheduler_reply(&rig));
        assert_eq!(0, rig.mmu.frames_in_use());
    }

    #[test]
    fn free_zero_blocks_is_noop_success() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Allocate {
                pid: 1,
                blocks: 1,
                loading: true,
            },
        );
        scheduler_reply(&rig);
        send(&mut rig, Addr::Cpu, Command::Free { pid: 1, blocks: 0 });
        assert_eq!(1, rig.mmu.pages_of(1));
        assert!(rig.mailbox.get(Addr::Scheduler).is_none());
    }

    #[test]
    fn exact_capacity_fills_then_one_more_exceeds() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Allocate {
                pid: 1,
                blocks: PAGE_SIZE * PAGE_COUNT,
                loading: true,
            },
        );
        assert_eq!(Command::Allocated { pid: 1 }, scheduler_reply(&rig));
        assert_eq!(PAGE_COUNT, rig.mmu.frames_in_use());

        send(
            &mut rig,
            Addr::Cpu,
            Command::Allocate {
                pid: 1,
                blocks: 1,
                loading: false,
            },
        );
        assert_eq!(Command::Drop { pid: 1 }, scheduler_reply(&rig));
        assert!(rig.log.contains("[MMU/ERROR] Out of memory for PID 1"));
    }

    #[test]
    fn over_free_drops_process() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Allocate {
                pid: 1,
                blocks: 1,
                loading: true,
            },
        );
        scheduler_reply(&rig);
        send(&mut rig, Addr::Cpu, Command::Free { pid: 1, blocks: 999 });
        assert_eq!(Command::Drop { pid: 1 }, scheduler_reply(&rig));
        assert!(rig
            .log
            .contains("[MMU/ERROR] PID 1 attempted to free more memory than allocated"));
    }

    #[test]
    fn read_write_round_trip_and_unmapped_read_drops() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Allocate {
                pid: 1,
                blocks: 2,
                loading: true,
            },
        );
        scheduler_reply(&rig);
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Write {
                pid: 1,
                addr: 1,
                data: "hello".to_string(),
                last: false,
            },
        );
        send(
            &mut rig,
            Addr::Proc(1),
            Command::Read {
                pid: 1,
                addr: 1,
                last: true,
            },
        );
        let reply = rig.mailbox.get(Addr::Proc(1)).expect("data reply");
        assert_eq!(
            Command::Data {
                value: "hello".to_string(),
                last: true
            },
            reply.command
        );
        assert_eq!(Command::Unblock { pid: 1 }, scheduler_reply(&rig));

        // Page 5 is not mapped for this process.
        send(
            &mut rig,
            Addr::Proc(1),
            Command::Read {
                pid: 1,
                addr: 11,
                last: true,
            },
        );
        assert_eq!(Command::Drop { pid: 1 }, scheduler_reply(&rig));
    }

    #[test]
    fn empty_cell_read_drops() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Allocate {
                pid: 1,
                blocks: 2,
                loading: true,
            },
        );
        scheduler_reply(&rig);
        send(
            &mut rig,
            Addr::Proc(1),
            Command::Read {
                pid: 1,
                addr: 0,
                last: true,
            },
        );
        assert_eq!(Command::Drop { pid: 1 }, scheduler_reply(&rig));
    }

    #[test]
    fn no_free_frames_swaps_out_victims_in_order() {
        let mut rig = rig();
        for pid in [1, 2] {
            send(
                &mut rig,
                Addr::Scheduler,
                Command::Allocate {
                    pid,
                    blocks: PAGE_SIZE * PAGE_COUNT / 2,
                    loading: true,
                },
            );
            assert_eq!(Command::Allocated { pid }, scheduler_reply(&rig));
        }
        // Give PID 1 something to restore later.
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Write {
                pid: 1,
                addr: 0,
                data: "keep".to_string(),
                last: false,
            },
        );
        *rig.swappable.lock().unwrap() = vec![1, 2];

        send(
            &mut rig,
            Addr::Cpu,
            Command::Allocate {
                pid: 3,
                blocks: 1,
                loading: false,
            },
        );
        // Oldest victim first, then the retry succeeds.
        assert_eq!(Command::SwappedOut { pid: 1 }, scheduler_reply(&rig));
        assert_eq!(Command::Unblock { pid: 3 }, scheduler_reply(&rig));
        assert_eq!(0, rig.mmu.pages_of(1));
        assert_eq!(1, rig.mmu.pages_of(3));
        assert!(rig.log.contains("[MMU] Swapped out PID 1"));
    }

    #[test]
    fn no_victims_available_skips_requester() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Allocate {
                pid: 1,
                blocks: PAGE_SIZE * PAGE_COUNT,
                loading: true,
            },
        );
        scheduler_reply(&rig);
        send(
            &mut rig,
            Addr::Cpu,
            Command::Allocate {
                pid: 2,
                blocks: 1,
                loading: false,
            },
        );
        assert_eq!(Command::Skip { pid: 2 }, scheduler_reply(&rig));
    }

    #[test]
    fn swap_round_trip_restores_cells_contiguously() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Allocate {
                pid: 1,
                blocks: 4,
                loading: true,
            },
        );
        scheduler_reply(&rig);
        for (addr, value) in [(0, "a"), (1, "b"), (2, "c")] {
            send(
                &mut rig,
                Addr::Scheduler,
                Command::Write {
                    pid: 1,
                    addr,
                    data: value.to_string(),
                    last: false,
                },
            );
        }

        rig.mmu.swap_out(1).unwrap();
        assert_eq!(0, rig.mmu.pages_of(1));
        assert_eq!(0, rig.mmu.frames_in_use());

        send(&mut rig, Addr::Scheduler, Command::SwapIn { pid: 1 });
        assert_eq!(Command::SwappedIn { pid: 1 }, scheduler_reply(&rig));
        assert_eq!(Some("a".to_string()), rig.mmu.read(1, 0));
        assert_eq!(Some("b".to_string()), rig.mmu.read(1, 1));
        assert_eq!(Some("c".to_string()), rig.mmu.read(1, 2));
        assert_eq!(None, rig.mmu.read(1, 3));
    }

    #[test]
    fn drop_flushes_pages_and_removes_swap_file() {
        let mut rig = rig();
        send(
            &mut rig,
            Addr::Scheduler,
            Command::Allocate {
                pid: 1,
                blocks: 2,
                loading: true,
            },
        );
        scheduler_reply(&rig);
        rig.mmu.swap_out(1).unwrap();
        let swap_file = rig.mmu.swap_path(1);
        assert!(swap_file.exists());

        send(&mut rig, Addr::Scheduler, Command::Drop { pid: 1 });
        assert_eq!(0, rig.mmu.pages_of(1));
        assert!(!swap_file.exists());
        assert!(rig.log.contains("[MMU] Dropped PID 1"));
    }
}
