use tokio::sync::mpsc;
// Use external log crate, not our own log module
use ::log::{debug, info};

use super::{EntryPayload, LogEntry};

/// Application state machine fed with committed commands.
pub trait StateMachine: Send + 'static {
    /// Applies the command committed at `index`. Called strictly in
    /// increasing index order.
    fn apply(&mut self, index: u64, command: &[u8]) -> Vec<u8>;

    /// Highest index already reflected in the machine. Entries at or below
    /// it are skipped, which is how replays after a restart are suppressed.
    fn applied_index(&self) -> u64 {
        0
    }
}

/// Drains committed entries from the node and applies them in order.
pub struct Applier<S: StateMachine> {
    machine: S,
    rx: mpsc::UnboundedReceiver<LogEntry>,
    cursor: u64,
}

impl<S: StateMachine> Applier<S> {
    pub fn new(machine: S, rx: mpsc::UnboundedReceiver<LogEntry>) -> Self {
        let cursor = machine.applied_index();
        Self { machine, rx, cursor }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Applies one entry, returning the machine's result for commands that
    /// were not already applied.
    pub fn apply_entry(&mut self, entry: LogEntry) -> Option<Vec<u8>> {
        if entry.index <= self.cursor {
            debug!("Skipping already applied entry {}", entry.index);
            return None;
        }
        self.cursor = entry.index;
        match entry.payload {
            EntryPayload::Noop => None,
            EntryPayload::Command(command) => Some(self.machine.apply(entry.index, &command)),
        }
    }

    /// Runs until the node drops its sender, then hands the machine back.
    pub async fn run(mut self) -> S {
        while let Some(entry) = self.rx.recv().await {
            self.apply_entry(entry);
        }
        info!("Applier stopped at index {}", self.cursor);
        self.machine
    }
}
