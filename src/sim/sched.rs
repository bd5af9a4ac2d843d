//! Preemptive round-robin scheduler.
//!
//! Admits programs, keeps the ready queue and the blocked and swapped
//! sets, rotates the running process when its quantum expires and
//! coordinates swapping with the MMU through the swappable snapshot and
//! the swap lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::journal::Journal;

use super::mailbox::{Addr, Command, Mailbox};
use super::pcb::{scan_labels, Pcb, Pid, Status};

pub struct Scheduler {
    mailbox: Arc<Mailbox>,
    log: Journal,
    quantum: u32,
    swap_lock: Arc<Mutex<()>>,
    swappable: Arc<Mutex<Vec<Pid>>>,
    state: Mutex<SchedState>,
}

#[derive(Default)]
struct SchedState {
    table: HashMap<Pid, Arc<Mutex<Pcb>>>,
    ready: VecDeque<Pid>,
    blocked: HashSet<Pid>,
    swapped: HashSet<Pid>,
    /// PIDs sent to the MMU for swap-in and not yet resolved.
    pending_swap_in: HashSet<Pid>,
    /// Program lines held between admission and code loading.
    pending_code: HashMap<Pid, Vec<String>>,
    running: Option<Pid>,
    run_ticks: u32,
    /// Terminated PIDs removed from all queues at the next tick.
    reap: Vec<Pid>,
    next_pid: Pid,
    admitted: u32,
}

impl Scheduler {
    pub fn new(
        mailbox: Arc<Mailbox>,
        log: Journal,
        quantum: u32,
        swap_lock: Arc<Mutex<()>>,
        swappable: Arc<Mutex<Vec<Pid>>>,
    ) -> Scheduler {
        Scheduler {
            mailbox,
            log,
            quantum,
            swap_lock,
            swappable,
            state: Mutex::new(SchedState::default()),
        }
    }

    pub fn tick(&self) {
        self.reap_terminated();
        self.drain_messages();
        self.advance();
        self.publish_swappable();
    }

    /// Handle to the RUNNING PCB, if any. Does not block.
    pub fn get_running(&self) -> Option<Arc<Mutex<Pcb>>> {
        let state = self.state.lock().unwrap();
        state.running.and_then(|pid| state.table.get(&pid).cloned())
    }

    /// Move the running process to BLOCKED. Called by the CPU when an
    /// instruction is waiting on the MMU.
    pub fn block(&self, pid: Pid) {
        let mut state = self.state.lock().unwrap();
        if state.running == Some(pid) {
            state.running = None;
            state.run_ticks = 0;
        }
        if let Some(pcb) = state.table.get(&pid) {
            pcb.lock().unwrap().status = Status::Blocked;
        }
        state.blocked.insert(pid);
    }

    /// Number of processes admitted so far.
    pub fn admitted(&self) -> u32 {
        self.state.lock().unwrap().admitted
    }

    /// Number of processes not yet reaped.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().table.len()
    }

    fn reap_terminated(&self) {
        let mut state = self.state.lock().unwrap();
        for pid in std::mem::take(&mut state.reap) {
            state.table.remove(&pid);
            state.ready.retain(|&p| p != pid);
            state.blocked.remove(&pid);
            state.swapped.remove(&pid);
            state.pending_swap_in.remove(&pid);
            state.pending_code.remove(&pid);
        }
    }

    fn drain_messages(&self) {
        while let Some(message) = self.mailbox.get(Addr::Scheduler) {
            let mut state = self.state.lock().unwrap();
            match message.command {
                Command::Admit { path, code_length } => {
                    self.admit(&mut state, path, code_length)
                }
                Command::Allocated { pid } => self.load_code(&mut state, pid),
                Command::Unblock { pid } => {
                    // A stray unblock for a process that is not blocked
                    // (the final code-load write produces one) is a no-op.
                    if state.blocked.remove(&pid) {
                        if let Some(pcb) = state.table.get(&pid) {
                            pcb.lock().unwrap().status = Status::Ready;
                        }
                        state.ready.push_back(pid);
                    } else if state.swapped.contains(&pid) && !state.ready.contains(&pid) {
                        // The victim's last reply landed after it was
                        // swapped out; queue it so scheduling it again
                        // requests the swap-in.
                        state.ready.push_back(pid);
                    }
                }
                Command::Drop { pid } => self.drop_process(&mut state, pid),
                Command::SwappedOut { pid } => {
                    state.ready.retain(|&p| p != pid);
                    state.blocked.remove(&pid);
                    state.swapped.insert(pid);
                    if state.running == Some(pid) {
                        state.running = None;
                        state.run_ticks = 0;
                    }
                    if let Some(pcb) = state.table.get(&pid) {
                        pcb.lock().unwrap().status = Status::SwappedOut;
                    }
                }
                Command::SwappedIn { pid } => {
                    state.swapped.remove(&pid);
                    state.pending_swap_in.remove(&pid);
                    if let Some(pcb) = state.table.get(&pid) {
                        pcb.lock().unwrap().status = Status::Ready;
                    }
                    state.ready.push_back(pid);
                }
                Command::Skip { pid } => {
                    state.blocked.remove(&pid);
                    state.pending_swap_in.remove(&pid);
                    if let Some(pcb) = state.table.get(&pid) {
                        let mut pcb = pcb.lock().unwrap();
                        // Swapped-out and never-loaded processes keep
                        // their status; reaching the head of the ready
                        // queue retries them instead of running them.
                        if pcb.status != Status::SwappedOut && pcb.status != Status::New {
                            pcb.status = Status::Ready;
                        }
                    }
                    if !state.ready.contains(&pid) {
                        state.ready.push_back(pid);
                    }
                    self.log.append(format!("[SCHEDULER] Skipped PID {}", pid));
                }
                _ => {}
            }
        }
    }

    fn admit(&self, state: &mut SchedState, path: PathBuf, code_length: usize) {
        let src = match fs::read_to_string(&path) {
            Ok(src) => src,
            Err(e) => {
                self.log.append(format!(
                    "[SCHEDULER/ERROR] Cannot read program {}: {}",
                    path.display(),
                    e
                ));
                return;
            }
        };
        state.next_pid += 1;
        let pid = state.next_pid;
        let load_order = state.admitted;
        state.admitted += 1;
        let labels = scan_labels(&src);
        let pcb = Pcb::new(pid, path.clone(), code_length, load_order, labels);
        state.table.insert(pid, Arc::new(Mutex::new(pcb)));
        state
            .pending_code
            .insert(pid, src.lines().map(|line| line.to_string()).collect());
        self.mailbox.put(
            Addr::Scheduler,
            Addr::Mmu,
            Command::Allocate {
                pid,
                blocks: code_length,
                loading: true,
            },
        );
        self.log.append(format!(
            "[SCHEDULER] Admitted {} as PID {}",
            path.display(),
            pid
        ));
        log::debug!("admitted {} as pid {}", path.display(), pid);
    }

    /// Code pages are allocated; stream the program lines into the
    /// first `code_length` virtual addresses and make the PID ready.
    fn load_code(&self, state: &mut SchedState, pid: Pid) {
        let Some(lines) = state.pending_code.remove(&pid) else {
            return;
        };
        let count = lines.len();
        for (addr, line) in lines.into_iter().enumerate() {
            self.mailbox.put(
                Addr::Scheduler,
                Addr::Mmu,
                Command::Write {
                    pid,
                    addr,
                    data: line,
                    last: addr + 1 == count,
                },
            );
        }
        if let Some(pcb) = state.table.get(&pid) {
            pcb.lock().unwrap().status = Status::Ready;
        }
        state.ready.push_back(pid);
        self.log.append(format!("[SCHEDULER] Loaded PID {}", pid));
    }

    fn drop_process(&self, state: &mut SchedState, pid: Pid) {
        if let Some(pcb) = state.table.get(&pid) {
            pcb.lock().unwrap().status = Status::Terminated;
        }
        if state.running == Some(pid) {
            state.running = None;
            state.run_ticks = 0;
        }
        self.mailbox
            .put(Addr::Scheduler, Addr::Cpu, Command::Drop { pid });
        self.mailbox
            .put(Addr::Scheduler, Addr::Mmu, Command::Drop { pid });
        state.reap.push(pid);
        self.log.append(format!("[SCHEDULER] Dropped PID {}", pid));
    }

    /// Advance the running process by one quantum slot, unless the MMU
    /// holds the swap lock while residency is in flux.
    fn advance(&self) {
        let Ok(_guard) = self.swap_lock.try_lock() else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        if let Some(pid) = state.running {
            state.run_ticks += 1;
            if state.run_ticks >= self.quantum {
                if let Some(pcb) = state.table.get(&pid) {
                    pcb.lock().unwrap().status = Status::Ready;
                }
                state.ready.push_back(pid);
                state.running = None;
                state.run_ticks = 0;
                self.log
                    .append(format!("[SCHEDULER] Quantum expired for PID {}", pid));
            }
            return;
        }
        while let Some(pid) = state.ready.pop_front() {
            let Some(pcb) = state.table.get(&pid).cloned() else {
                continue;
            };
            let status = pcb.lock().unwrap().status;
            match status {
                Status::Ready => {
                    pcb.lock().unwrap().status = Status::Running;
                    state.running = Some(pid);
                    state.run_ticks = 0;
                    break;
                }
                Status::SwappedOut => {
                    // A failed earlier swap-in leaves the head swapped
                    // out; ask the MMU to bring it back and leave it
                    // pending until swappedIn or skip resolves it.
                    if state.pending_swap_in.insert(pid) {
                        self.mailbox
                            .put(Addr::Scheduler, Addr::Mmu, Command::SwapIn { pid });
                        self.log
                            .append(format!("[SCHEDULER] Swapping in PID {}", pid));
                    }
                }
                Status::New => {
                    // The admission allocate was skipped for lack of a
                    // swap victim; ask again now.
                    if state.pending_code.contains_key(&pid) {
                        let blocks = pcb.lock().unwrap().code_length;
                        self.mailbox.put(
                            Addr::Scheduler,
                            Addr::Mmu,
                            Command::Allocate {
                                pid,
                                blocks,
                                loading: true,
                            },
                        );
                        self.log
                            .append(format!("[SCHEDULER] Retrying allocation for PID {}", pid));
                    }
                }
                _ => {}
            }
        }
        // With nothing runnable, bring back the oldest swapped-out
        // process that is not already on its way in.
        if state.running.is_none() && state.ready.is_empty() {
            let mut swapped: Vec<Pid> = state
                .swapped
                .iter()
                .filter(|pid| !state.pending_swap_in.contains(pid))
                .copied()
                .collect();
            swapped.sort_by_key(|pid| {
                state
                    .table
                    .get(pid)
                    .map_or(u32::MAX, |pcb| pcb.lock().unwrap().load_order)
            });
            if let Some(&pid) = swapped.first() {
                state.pending_swap_in.insert(pid);
                self.mailbox
                    .put(Addr::Scheduler, Addr::Mmu, Command::SwapIn { pid });
                self.log
                    .append(format!("[SCHEDULER] Swapping in PID {}", pid));
            }
        }
    }

    /// Publish the victim candidates: BLOCKED processes in admission
    /// order, then the tail of the ready queue.
    fn publish_swappable(&self) {
        let state = self.state.lock().unwrap();
        let mut candidates: Vec<Pid> = state.blocked.iter().copied().collect();
        candidates.sort_by_key(|pid| {
            state
                .table
                .get(pid)
                .map_or(u32::MAX, |pcb| pcb.lock().unwrap().load_order)
        });
        if let Some(&tail) = state.ready.back() {
            if !candidates.contains(&tail) {
                candidates.push(tail);
            }
        }
        *self.swappable.lock().unwrap() = candidates;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_program(lines: &str) -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "ossim-sched-{}-{}.txt",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "{}", lines).unwrap();
        path
    }

    struct Rig {
        scheduler: Scheduler,
        mailbox: Arc<Mailbox>,
        swappable: Arc<Mutex<Vec<Pid>>>,
        swap_lock: Arc<Mutex<()>>,
    }

    fn rig(quantum: u32) -> Rig {
        let mailbox = Arc::new(Mailbox::new(Journal::new()));
        let swap_lock = Arc::new(Mutex::new(()));
        let swappable = Arc::new(Mutex::new(Vec::new()));
        let scheduler = Scheduler::new(
            mailbox.clone(),
            Journal::new(),
            quantum,
            swap_lock.clone(),
            swappable.clone(),
        );
        Rig {
            scheduler,
            mailbox,
            swappable,
            swap_lock,
        }
    }

    fn admit(rig: &Rig, src: &str) -> Pid {
        let path = temp_program(src);
        let code_length = src.lines().count();
        rig.mailbox.put(
            Addr::Scheduler,
            Addr::Scheduler,
            Command::Admit { path, code_length },
        );
        rig.scheduler.tick();
        rig.scheduler.admitted()
    }

    #[test]
    fn admission_requests_code_allocation() {
        let rig = rig(3);
        let pid = admit(&rig, "null\nexit\n");
        let request = rig.mailbox.get(Addr::Mmu).expect("allocate request");
        assert_eq!(
            Command::Allocate {
                pid,
                blocks: 2,
                loading: true
            },
            request.command
        );
        assert_eq!(1, rig.scheduler.live());
        assert!(rig.scheduler.get_running().is_none());
    }

    #[test]
    fn allocated_loads_code_and_schedules() {
        let rig = rig(3);
        let pid = admit(&rig, "null\nexit\n");
        rig.mailbox.get(Addr::Mmu);
        rig.mailbox
            .put(Addr::Mmu, Addr::Scheduler, Command::Allocated { pid });
        rig.scheduler.tick();

        // Sequential writes, only the last one final.
        let first = rig.mailbox.get(Addr::Mmu).expect("first write").command;
        let second = rig.mailbox.get(Addr::Mmu).expect("second write").command;
        assert_eq!(
            Command::Write {
                pid,
                addr: 0,
                data: "null".to_string(),
                last: false
            },
            first
        );
        assert_eq!(
            Command::Write {
                pid,
                addr: 1,
                data: "exit".to_string(),
                last: true
            },
            second
        );
        let running = rig.scheduler.get_running().expect("running");
        assert_eq!(pid, running.lock().unwrap().pid);
        assert_eq!(Status::Running, running.lock().unwrap().status);
    }

    fn admit_and_run(rig: &Rig, src: &str) -> Pid {
        let pid = admit(rig, src);
        rig.mailbox.get(Addr::Mmu);
        rig.mailbox
            .put(Addr::Mmu, Addr::Scheduler, Command::Allocated { pid });
        rig.scheduler.tick();
        while rig.mailbox.get(Addr::Mmu).is_some() {}
        pid
    }

    #[test]
    fn quantum_expiry_rotates_running_process() {
        let rig = rig(2);
        let first = admit(&rig, "null\nnull\nnull\nexit\n");
        let second = admit(&rig, "null\nexit\n");
        rig.mailbox
            .put(Addr::Mmu, Addr::Scheduler, Command::Allocated { pid: first });
        rig.mailbox
            .put(Addr::Mmu, Addr::Scheduler, Command::Allocated { pid: second });
        rig.scheduler.tick();
        while rig.mailbox.get(Addr::Mmu).is_some() {}
        assert_eq!(
            first,
            rig.scheduler.get_running().unwrap().lock().unwrap().pid
        );

        rig.scheduler.tick();
        assert_eq!(
            first,
            rig.scheduler.get_running().unwrap().lock().unwrap().pid
        );
        rig.scheduler.tick();
        // Quantum of 2 expired; the other process takes over next tick.
        assert!(rig.scheduler.get_running().is_none());
        rig.scheduler.tick();
        assert_eq!(
            second,
            rig.scheduler.get_running().unwrap().lock().unwrap().pid
        );
    }

    #[test]
    fn block_and_unblock_cycle() {
        let rig = rig(5);
        let pid = admit_and_run(&rig, "null\nexit\n");
        rig.scheduler.block(pid);
        assert!(rig.scheduler.get_running().is_none());

        rig.mailbox
            .put(Addr::Mmu, Addr::Scheduler, Command::Unblock { pid });
        rig.scheduler.tick();
        let running = rig.scheduler.get_running().expect("rescheduled");
        assert_eq!(pid, running.lock().unwrap().pid);
    }

    #[test]
    fn blocked_processes_are_swappable_in_admission_order() {
        let rig = rig(5);
        let first = admit_and_run(&rig, "null\nexit\n");
        let second = admit_and_run(&rig, "null\nexit\n");
        rig.scheduler.block(first);
        rig.scheduler.block(second);
        rig.scheduler.tick();
        assert_eq!(vec![first, second], rig.swappable.lock().unwrap().clone());
    }

    #[test]
    fn drop_broadcasts_and_reaps_next_tick() {
        let rig = rig(5);
        let pid = admit_and_run(&rig, "null\nexit\n");
        rig.mailbox
            .put(Addr::Cpu, Addr::Scheduler, Command::Drop { pid });
        rig.scheduler.tick();

        let to_cpu = rig.mailbox.get(Addr::Cpu).expect("cpu drop").command;
        let to_mmu = rig.mailbox.get(Addr::Mmu).expect("mmu drop").command;
        assert_eq!(Command::Drop { pid }, to_cpu);
        assert_eq!(Command::Drop { pid }, to_mmu);
        assert_eq!(1, rig.scheduler.live());

        rig.scheduler.tick();
        assert_eq!(0, rig.scheduler.live());
        assert!(rig.scheduler.get_running().is_none());
    }

    #[test]
    fn swapped_out_process_is_requested_back_when_scheduled() {
        let rig = rig(5);
        let pid = admit_and_run(&rig, "null\nexit\n");
        rig.scheduler.block(pid);
        rig.mailbox
            .put(Addr::Mmu, Addr::Scheduler, Command::SwappedOut { pid });
        rig.scheduler.tick();
        assert!(rig.scheduler.get_running().is_none());

        // Skip re-queues it while still swapped out; scheduling it asks
        // the MMU for a swap-in.
        rig.mailbox
            .put(Addr::Mmu, Addr::Scheduler, Command::Skip { pid });
        rig.scheduler.tick();
        let request = rig.mailbox.get(Addr::Mmu).expect("swap-in").command;
        assert_eq!(Command::SwapIn { pid }, request);
        assert!(rig.scheduler.get_running().is_none());

        rig.mailbox
            .put(Addr::Mmu, Addr::Scheduler, Command::SwappedIn { pid });
        rig.scheduler.tick();
        assert_eq!(
            pid,
            rig.scheduler.get_running().unwrap().lock().unwrap().pid
        );
    }

    #[test]
    fn held_swap_lock_stops_advancing() {
        let rig = rig(5);
        let pid = admit_and_run(&rig, "null\nexit\n");
        rig.scheduler.block(pid);
        rig.mailbox
            .put(Addr::Mmu, Addr::Scheduler, Command::Unblock { pid });

        let guard = rig.swap_lock.lock().unwrap();
        rig.scheduler.tick();
        // The unblock was drained but nothing was scheduled.
        assert!(rig.scheduler.get_running().is_none());
        drop(guard);

        rig.scheduler.tick();
        assert!(rig.scheduler.get_running().is_some());
    }
}
