use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::AppConfig;
use crate::error::HardwareError;
use crate::gpio::{Direction, LineBackend, LineHandle};

/// Levels remembered per line for `writes` and `attempts`; older entries are
/// forgotten.
pub const HISTORY_CAPACITY: usize = 1024;

/// In-memory hardware. Clones share the same simulated lines, so a test can
/// keep one clone to inject faults and inspect what was commanded.
#[derive(Clone, Default)]
pub struct MockGpioBackend {
    known: Option<Arc<FxHashSet<u32>>>, // None accepts any line id
    lines: Arc<Mutex<FxHashMap<u32, MockLine>>>,
}

#[derive(Default)]
struct MockLine {
    direction: Option<Direction>,
    level: bool,
    writes: VecDeque<bool>,
    attempts: VecDeque<bool>,
    released: usize,
    fail_configure: bool,
    fail_writes: bool,
    fail_reads: bool,
}

pub struct MockLineHandle {
    line_id: u32,
    lines: Arc<Mutex<FxHashMap<u32, MockLine>>>,
}

impl MockGpioBackend {
    pub fn with_lines<I: IntoIterator<Item = u32>>(lines: I) -> Self {
        Self {
            known: Some(Arc::new(lines.into_iter().collect())),
            lines: Arc::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::with_lines(config.gpios.keys().copied())
    }

    /// Sets the level an input line will report.
    pub fn set_level(&self, line_id: u32, level: bool) {
        self.lines.lock().entry(line_id).or_default().level = level;
    }

    /// Current level of the line as last driven or set.
    pub fn level(&self, line_id: u32) -> bool {
        self.lines.lock().get(&line_id).is_some_and(|l| l.level)
    }

    /// Levels written to the line, oldest first, up to the last
    /// [`HISTORY_CAPACITY`].
    pub fn writes(&self, line_id: u32) -> Vec<bool> {
        self.lines
            .lock()
            .get(&line_id)
            .map(|l| l.writes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Levels commanded on the line, including rejected writes, up to the last
    /// [`HISTORY_CAPACITY`].
    pub fn attempts(&self, line_id: u32) -> Vec<bool> {
        self.lines
            .lock()
            .get(&line_id)
            .map(|l| l.attempts.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of handles for the line that have been dropped.
    pub fn released(&self, line_id: u32) -> usize {
        self.lines.lock().get(&line_id).map_or(0, |l| l.released)
    }

    /// Direction the line is currently requested with, if held.
    pub fn direction(&self, line_id: u32) -> Option<Direction> {
        self.lines.lock().get(&line_id).and_then(|l| l.direction)
    }

    pub fn fail_configure(&self, line_id: u32, fail: bool) {
        self.lines.lock().entry(line_id).or_default().fail_configure = fail;
    }

    pub fn fail_writes(&self, line_id: u32, fail: bool) {
        self.lines.lock().entry(line_id).or_default().fail_writes = fail;
    }

    pub fn fail_reads(&self, line_id: u32, fail: bool) {
        self.lines.lock().entry(line_id).or_default().fail_reads = fail;
    }
}

impl LineBackend for MockGpioBackend {
    type Handle = MockLineHandle;

    fn request_line(
        &self,
        line_id: u32,
        direction: Direction,
    ) -> Result<Self::Handle, HardwareError> {
        if let Some(known) = &self.known
            && !known.contains(&line_id)
        {
            return Err(HardwareError::UnknownLine(line_id));
        }

        let mut lines = self.lines.lock();
        let line = lines.entry(line_id).or_default();
        if line.fail_configure {
            return Err(HardwareError::Fault(format!(
                "line {line_id} refused configuration"
            )));
        }
        if line.direction.is_some() {
            return Err(HardwareError::Fault(format!("line {line_id} busy")));
        }

        line.direction = Some(direction);
        if direction == Direction::Output {
            line.level = false;
        }

        Ok(MockLineHandle {
            line_id,
            lines: self.lines.clone(),
        })
    }
}

impl LineHandle for MockLineHandle {
    fn write(&mut self, level: bool) -> Result<(), HardwareError> {
        let mut lines = self.lines.lock();
        let line = lines.entry(self.line_id).or_default();
        remember(&mut line.attempts, level);
        if line.fail_writes {
            return Err(HardwareError::Fault(format!(
                "line {} write fault",
                self.line_id
            )));
        }
        line.level = level;
        remember(&mut line.writes, level);
        Ok(())
    }

    fn read(&self) -> Result<bool, HardwareError> {
        let lines = self.lines.lock();
        match lines.get(&self.line_id) {
            Some(line) if line.fail_reads => Err(HardwareError::Fault(format!(
                "line {} read fault",
                self.line_id
            ))),
            Some(line) => Ok(line.level),
            None => Ok(false),
        }
    }
}

fn remember(history: &mut VecDeque<bool>, level: bool) {
    while history.len() >= HISTORY_CAPACITY {
        history.pop_front();
    }
    history.push_back(level);
}

impl Drop for MockLineHandle {
    fn drop(&mut self) {
        let mut lines = self.lines.lock();
        let line = lines.entry(self.line_id).or_default();
        line.direction = None;
        line.released += 1;
    }
}
