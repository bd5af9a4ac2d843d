use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::journal::Journal;

use super::pcb::Pid;

/// A mailbox address. Recipients are a closed set: the three components
/// plus one private channel per live PID for data replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addr {
    Scheduler,
    Mmu,
    Cpu,
    Proc(Pid),
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Addr::Scheduler => write!(f, "SCHEDULER"),
            Addr::Mmu => write!(f, "MMU"),
            Addr::Cpu => write!(f, "CPU"),
            Addr::Proc(pid) => write!(f, "{}", pid),
        }
    }
}

/// Every verb the components exchange. `Display` renders the
/// pipe-delimited token form that appears in the mailbox log.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Admit { path: PathBuf, code_length: usize },
    Allocate { pid: Pid, blocks: usize, loading: bool },
    Free { pid: Pid, blocks: usize },
    SwapIn { pid: Pid },
    Read { pid: Pid, addr: usize, last: bool },
    Write { pid: Pid, addr: usize, data: String, last: bool },
    Data { value: String, last: bool },
    Allocated { pid: Pid },
    Unblock { pid: Pid },
    Skip { pid: Pid },
    Drop { pid: Pid },
    SwappedOut { pid: Pid },
    SwappedIn { pid: Pid },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Admit { path, code_length } => {
                write!(f, "admit|{}|{}", path.display(), code_length)
            }
            Command::Allocate {
                pid,
                blocks,
                loading,
            } => write!(f, "allocate|{}|{}|{}", pid, blocks, loading),
            Command::Free { pid, blocks } => write!(f, "free|{}|{}", pid, blocks),
            Command::SwapIn { pid } => write!(f, "swapIn|{}", pid),
            Command::Read { pid, addr, last } => write!(f, "read|{}|{}|{}", pid, addr, last),
            Command::Write {
                pid,
                addr,
                data,
                last,
            } => write!(f, "write|{}|{}|{}|{}", pid, addr, data, last),
            Command::Data { value, last } => write!(f, "data|{}|{}", value, last),
            Command::Allocated { pid } => write!(f, "allocated|{}", pid),
            Command::Unblock { pid } => write!(f, "unblock|{}", pid),
            Command::Skip { pid } => write!(f, "skip|{}", pid),
            Command::Drop { pid } => write!(f, "drop|{}", pid),
            Command::SwappedOut { pid } => write!(f, "swappedOut|{}", pid),
            Command::SwappedIn { pid } => write!(f, "swappedIn|{}", pid),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub sender: Addr,
    pub recipient: Addr,
    pub command: Command,
}

/// In-memory message bus keyed by recipient address.
///
/// FIFO per recipient, at-most-once delivery, no blocking `get`. Every
/// `put` is mirrored to the observable mailbox log.
pub struct Mailbox {
    queues: Mutex<HashMap<Addr, VecDeque<Message>>>,
    log: Journal,
}

impl Mailbox {
    pub fn new(log: Journal) -> Mailbox {
        Mailbox {
            queues: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn put(&self, sender: Addr, recipient: Addr, command: Command) {
        self.log
            .append(format!("[{} -> {}] {}", sender, recipient, command));
        self.queues
            .lock()
            .unwrap()
            .entry(recipient)
            .or_default()
            .push_back(Message {
                sender,
                recipient,
                command,
            });
    }

    /// Remove and return the oldest message for `recipient`, if any.
    pub fn get(&self, recipient: Addr) -> Option<Message> {
        self.queues
            .lock()
            .unwrap()
            .get_mut(&recipient)
            .and_then(|queue| queue.pop_front())
    }

    pub fn log(&self) -> &Journal {
        &self.log
    }
}
