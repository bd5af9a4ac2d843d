//! CPU. Executes instructions for whichever process the scheduler has
//! marked RUNNING.
//!
//! Each cycle either executes an instruction outright or requests the
//! data the current instruction needs from the MMU and logically blocks
//! the process until the replies arrive on its private channel.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::journal::Journal;

use super::expr;
use super::inst::{Fault, Inst};
use super::mailbox::{Addr, Command, Mailbox};
use super::pcb::{Pcb, Pid};
use super::sched::Scheduler;

pub struct Cpu {
    scheduler: Arc<Scheduler>,
    mailbox: Arc<Mailbox>,
    trace: Journal,
    output: Journal,
    output_dir: PathBuf,
    current: Option<Arc<Mutex<Pcb>>>,
    data_buffer: VecDeque<String>,
    /// Raw text of each process's current instruction line.
    instruction_cache: HashMap<Pid, String>,
    /// Variable name to virtual address, per process.
    var_cache: HashMap<Pid, HashMap<String, usize>>,
    /// Label name to line index, per process.
    label_cache: HashMap<Pid, HashMap<String, usize>>,
    /// Operand names of an in-flight `math`, in reply order.
    math_operands: HashMap<Pid, Vec<String>>,
    /// Output writer per process, closed on drop.
    outputs: HashMap<Pid, BufWriter<File>>,
}

impl Cpu {
    pub fn new(
        scheduler: Arc<Scheduler>,
        mailbox: Arc<Mailbox>,
        trace: Journal,
        output: Journal,
        output_dir: PathBuf,
    ) -> Cpu {
        Cpu {
            scheduler,
            mailbox,
            trace,
            output,
            output_dir,
            current: None,
            data_buffer: VecDeque::new(),
            instruction_cache: HashMap::new(),
            var_cache: HashMap::new(),
            label_cache: HashMap::new(),
            math_operands: HashMap::new(),
            outputs: HashMap::new(),
        }
    }

    pub fn tick(&mut self) {
        // Invalidate everything belonging to dropped processes.
        while let Some(message) = self.mailbox.get(Addr::Cpu) {
            if let Command::Drop { pid } = message.command {
                self.invalidate(pid);
                self.output.append(format!("[CPU] Dropped PID {}", pid));
            }
        }

        self.current = self.scheduler.get_running();
        let Some(pcb) = self.current.clone() else {
            return;
        };
        let (pid, pc) = {
            let pcb = pcb.lock().unwrap();
            (pcb.pid, pcb.pc)
        };
        self.data_buffer.clear();

        // Labels were scanned at admission; take a local copy once.
        if !self.label_cache.contains_key(&pid) {
            let labels = pcb.lock().unwrap().labels.clone();
            self.label_cache.insert(pid, labels);
        }

        // With no cached instruction, either a fetch reply is waiting on
        // the private channel or a fetch has to be requested.
        if !self.instruction_cache.contains_key(&pid) {
            match self.mailbox.get(Addr::Proc(pid)) {
                Some(message) => {
                    if let Command::Data { value, .. } = message.command {
                        self.instruction_cache.insert(pid, value);
                    }
                }
                None => {
                    self.mailbox.put(
                        Addr::Proc(pid),
                        Addr::Mmu,
                        Command::Read {
                            pid,
                            addr: pc,
                            last: true,
                        },
                    );
                    self.block(pid);
                    return;
                }
            }
        }

        // Drain requested data into the buffer, stopping at the final
        // reply. Order on the private channel matches request order.
        while let Some(message) = self.mailbox.get(Addr::Proc(pid)) {
            if let Command::Data { value, last } = message.command {
                self.data_buffer.push_back(value);
                if last {
                    break;
                }
            }
        }

        let cached = match self.instruction_cache.get(&pid) {
            Some(line) => line.clone(),
            None => return,
        };
        let instruction = match cached.split_once(':') {
            Some((_, rest)) => rest.to_string(),
            None => cached,
        };

        let result = if self.data_buffer.is_empty() {
            let result = self.exec(pid, &instruction);
            self.trace.append(format!("[{}] {}", pid, instruction));
            result
        } else {
            let result = self.exec_data(pid, &instruction);
            self.trace.append(format!("[{}/DATA] {}", pid, instruction));
            result
        };
        if let Err(fault) = result {
            self.output.append(format!(
                "[CPU/ERROR] {} in PID {} at '{}'",
                fault, pid, instruction
            ));
            log::debug!("pid {} faulted: {}", pid, fault);
            self.drop_process(pid);
        }
    }

    /// First execution phase: instructions that need no data run to
    /// completion, the rest request their reads and block.
    fn exec(&mut self, pid: Pid, instruction: &str) -> Result<(), Fault> {
        match Inst::parse(instruction)? {
            Inst::Null => self.next(pid),
            Inst::Var { name, addr, value } => {
                let real = self.with_pcb(|pcb| pcb.real_address(addr));
                self.var_cache.entry(pid).or_default().insert(name.clone(), real);
                match value {
                    Some(value) => {
                        self.write_var(pid, &name, value, true)?;
                        self.next(pid);
                        self.block(pid);
                    }
                    None => self.next(pid),
                }
            }
            Inst::Alloc(blocks) => {
                self.mailbox.put(
                    Addr::Cpu,
                    Addr::Mmu,
                    Command::Allocate {
                        pid,
                        blocks,
                        loading: false,
                    },
                );
                self.next(pid);
                self.block(pid);
            }
            Inst::Free(blocks) => {
                self.mailbox
                    .put(Addr::Cpu, Addr::Mmu, Command::Free { pid, blocks });
                self.next(pid);
            }
            Inst::Exit => self.drop_process(pid),
            Inst::Jump(label) => {
                let line = self.lookup_label(pid, &label)?;
                self.with_pcb(|pcb| pcb.pc = line);
                self.instruction_cache.remove(&pid);
            }
            Inst::JumpIf { lhs, rhs, label, .. } => {
                self.lookup_label(pid, &label)?;
                if self.is_var(pid, &rhs) {
                    self.read_var(pid, &lhs, false)?;
                    self.read_var(pid, &rhs, true)?;
                } else {
                    self.read_var(pid, &lhs, true)?;
                }
                self.block(pid);
            }
            Inst::Set { target, source } => {
                if self.is_var(pid, &source) {
                    self.read_var(pid, &source, true)?;
                } else {
                    self.write_var(pid, &target, source, true)?;
                    self.next(pid);
                }
                self.block(pid);
            }
            Inst::Out(var) | Inst::Inc(var) | Inst::Dec(var) => {
                self.read_var(pid, &var, true)?;
                self.block(pid);
            }
            Inst::Math(expression) => {
                let operands = {
                    let vars = self.var_cache.get(&pid);
                    expr::operand_vars(&expression, |name| {
                        vars.map_or(false, |vars| vars.contains_key(name))
                    })
                };
                if operands.is_empty() {
                    // All-literal expression; nothing to read.
                    self.math_operands.insert(pid, operands);
                    return self.finish_math(pid, &expression);
                }
                let count = operands.len();
                for (i, var) in operands.iter().enumerate() {
                    self.read_var(pid, var, i + 1 == count)?;
                }
                self.math_operands.insert(pid, operands);
                self.block(pid);
            }
        }
        Ok(())
    }

    /// Second execution phase, entered once the requested data sits in
    /// the buffer.
    fn exec_data(&mut self, pid: Pid, instruction: &str) -> Result<(), Fault> {
        match Inst::parse(instruction)? {
            Inst::Out(_) => {
                let value = self.take_data()?;
                self.output.append(format!("[{}] {}", pid, value));
                self.write_output(pid, &value)?;
                self.next(pid);
            }
            Inst::Inc(var) => {
                let value = self.take_number()?;
                self.write_var(pid, &var, expr::fmt_double(value + 1.0), true)?;
                self.next(pid);
                self.block(pid);
            }
            Inst::Dec(var) => {
                let value = self.take_number()?;
                self.write_var(pid, &var, expr::fmt_double(value - 1.0), true)?;
                self.next(pid);
                self.block(pid);
            }
            Inst::Set { target, .. } => {
                let value = self.take_data()?;
                self.write_var(pid, &target, value, true)?;
                self.next(pid);
                self.block(pid);
            }
            Inst::JumpIf {
                cmp, rhs, label, ..
            } => {
                let lhs = self.take_data()?;
                let rhs = if self.is_var(pid, &rhs) {
                    self.take_data()?
                } else {
                    rhs
                };
                if cmp.compare(&lhs, &rhs)? {
                    let line = self.lookup_label(pid, &label)?;
                    self.instruction_cache.remove(&pid);
                    self.with_pcb(|pcb| pcb.pc = line);
                } else {
                    self.next(pid);
                }
            }
            Inst::Math(expression) => self.finish_math(pid, &expression)?,
            _ => {}
        }
        Ok(())
    }

    /// Substitute buffered values into the expression, evaluate it and
    /// write the result to the target variable.
    fn finish_math(&mut self, pid: Pid, expression: &str) -> Result<(), Fault> {
        let (target, rhs) = expression
            .split_once('=')
            .ok_or_else(|| Fault::BadExpression(expression.to_string()))?;
        let target = target.to_string();
        let mut rhs = rhs.to_string();
        for name in self.math_operands.remove(&pid).unwrap_or_default() {
            let value = self.take_data()?;
            rhs = rhs.replace(&name, &value);
        }
        let result = expr::evaluate(&rhs)?;
        self.write_var(pid, &target, expr::fmt_double(result), true)?;
        self.next(pid);
        self.block(pid);
        Ok(())
    }

    fn take_data(&mut self) -> Result<String, Fault> {
        self.data_buffer.pop_front().ok_or(Fault::MissingData)
    }

    fn take_number(&mut self) -> Result<f64, Fault> {
        let value = self.take_data()?;
        value
            .parse::<f64>()
            .map_err(|_| Fault::BadNumber(value.clone()))
    }

    fn with_pcb<T>(&self, f: impl FnOnce(&mut Pcb) -> T) -> T {
        let pcb = self.current.as_ref().expect("current process");
        let mut pcb = pcb.lock().unwrap();
        f(&mut pcb)
    }

    /// Advance to the next instruction.
    fn next(&mut self, pid: Pid) {
        self.instruction_cache.remove(&pid);
        self.with_pcb(|pcb| pcb.pc += 1);
    }

    fn block(&mut self, pid: Pid) {
        self.scheduler.block(pid);
        self.current = None;
    }

    fn drop_process(&mut self, pid: Pid) {
        self.mailbox
            .put(Addr::Cpu, Addr::Scheduler, Command::Drop { pid });
        self.block(pid);
    }

    fn is_var(&self, pid: Pid, name: &str) -> bool {
        self.var_cache
            .get(&pid)
            .map_or(false, |vars| vars.contains_key(name))
    }

    fn lookup_label(&self, pid: Pid, label: &str) -> Result<usize, Fault> {
        self.label_cache
            .get(&pid)
            .and_then(|labels| labels.get(label))
            .copied()
            .ok_or_else(|| Fault::UndefinedLabel(label.to_string()))
    }

    /// Request a read of a variable's cell, reply routed to the
    /// process's private channel.
    fn read_var(&mut self, pid: Pid, var: &str, last: bool) -> Result<(), Fault> {
        let addr = self.var_address(pid, var)?;
        self.mailbox
            .put(Addr::Proc(pid), Addr::Mmu, Command::Read { pid, addr, last });
        Ok(())
    }

    fn write_var(&mut self, pid: Pid, var: &str, data: String, last: bool) -> Result<(), Fault> {
        let addr = self.var_address(pid, var)?;
        self.mailbox.put(
            Addr::Cpu,
            Addr::Mmu,
            Command::Write {
                pid,
                addr,
                data,
                last,
            },
        );
        Ok(())
    }

    fn var_address(&self, pid: Pid, var: &str) -> Result<usize, Fault> {
        self.var_cache
            .get(&pid)
            .and_then(|vars| vars.get(var))
            .copied()
            .ok_or_else(|| Fault::UndefinedVariable(var.to_string()))
    }

    /// Append one line to the process's output file, creating it on
    /// first use under a name that does not clobber an existing file.
    fn write_output(&mut self, pid: Pid, value: &str) -> Result<(), Fault> {
        let io_fault = |e: std::io::Error| Fault::Io(e.to_string());
        if !self.outputs.contains_key(&pid) {
            fs::create_dir_all(&self.output_dir).map_err(io_fault)?;
            let name = self.with_pcb(|pcb| {
                pcb.code_path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| format!("{}.txt", pid));
            let mut path = self.output_dir.join(&name);
            if path.exists() {
                let stem = name.split('.').next().unwrap_or(&name).to_string();
                let mut count = 1;
                loop {
                    let candidate = self.output_dir.join(format!("{}({}).txt", stem, count));
                    if !candidate.exists() {
                        path = candidate;
                        break;
                    }
                    count += 1;
                }
            }
            let file = File::create(&path).map_err(io_fault)?;
            self.outputs.insert(pid, BufWriter::new(file));
        }
        let writer = self.outputs.get_mut(&pid).ok_or(Fault::MissingData)?;
        writeln!(writer, "{}", value).map_err(io_fault)?;
        writer.flush().map_err(io_fault)?;
        Ok(())
    }

    fn invalidate(&mut self, pid: Pid) {
        self.instruction_cache.remove(&pid);
        self.var_cache.remove(&pid);
        self.label_cache.remove(&pid);
        self.math_operands.remove(&pid);
        if let Some(mut writer) = self.outputs.remove(&pid) {
            let _ = writer.flush();
        }
    }
}
