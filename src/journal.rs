use std::sync::{Arc, Mutex};

/// Append-only observable log stream.
///
/// The simulator publishes three of these (execution trace, general
/// output, mailbox log); a front end polls them with `tail`. Clones
/// share the same underlying buffer.
#[derive(Clone, Default)]
pub struct Journal {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Journal {
        Journal {
            lines: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn append(&self, line: impl Into<String>) {
        self.lines.lock().unwrap().push(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// Lines appended at or after index `from`.
    pub fn tail(&self, from: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap();
        lines[from.min(lines.len())..].to_vec()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_tail() {
        let journal = Journal::new();
        journal.append("a");
        journal.append("b");
        journal.append("c");
        assert_eq!(3, journal.len());
        assert_eq!(vec!["b".to_string(), "c".to_string()], journal.tail(1));
        assert!(journal.tail(10).is_empty());
    }

    #[test]
    fn clones_share_buffer() {
        let journal = Journal::new();
        let other = journal.clone();
        other.append("line");
        assert!(journal.contains("line"));
    }
}
