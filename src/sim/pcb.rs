use std::collections::HashMap;
use std::path::PathBuf;

pub type Pid = u32;

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    New,
    Ready,
    Running,
    Blocked,
    SwappedOut,
    Terminated,
}

/// Process control block.
///
/// The scheduler owns the table of these; the CPU holds a handle to the
/// one that is RUNNING and advances its `pc`. The virtual address space
/// is laid out as `[code | data]`, so a process-visible address `a`
/// refers to virtual address `a + code_length`.
#[derive(Debug)]
pub struct Pcb {
    pub pid: Pid,
    pub code_path: PathBuf,
    pub code_length: usize,
    pub pc: usize,
    pub status: Status,
    /// Admission order, used for victim tie-breaking.
    pub load_order: u32,
    /// Label name to line index, scanned once at admission.
    pub labels: HashMap<String, usize>,
}

impl Pcb {
    pub fn new(
        pid: Pid,
        code_path: PathBuf,
        code_length: usize,
        load_order: u32,
        labels: HashMap<String, usize>,
    ) -> Pcb {
        Pcb {
            pid,
            code_path,
            code_length,
            pc: 0,
            status: Status::New,
            load_order,
            labels,
        }
    }

    /// Translate a process-visible data address to a virtual address.
    pub fn real_address(&self, address: usize) -> usize {
        address + self.code_length
    }
}

/// Single pass over a program source collecting `name:rest` labels.
pub fn scan_labels(src: &str) -> HashMap<String, usize> {
    let mut labels = HashMap::new();
    for (line_num, line) in src.lines().enumerate() {
        if let Some((name, _)) = line.split_once(':') {
            labels.insert(name.to_string(), line_num);
        }
    }
    labels
}
