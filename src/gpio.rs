use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, HardwareError};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "in", alias = "input")]
    Input,
    #[serde(rename = "out", alias = "output")]
    Output,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

impl FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in" | "input" => Ok(Direction::Input),
            "out" | "output" => Ok(Direction::Output),
            other => Err(AppError::DirectionInvalid(format!(
                "'{other}', must be 'in' or 'out'"
            ))),
        }
    }
}

/// Exclusive ownership of one requested hardware line. Dropping the handle
/// releases the line.
pub trait LineHandle: Send + Sync {
    fn write(&mut self, level: bool) -> Result<(), HardwareError>;
    fn read(&self) -> Result<bool, HardwareError>;
}

pub trait LineBackend: Send + Sync {
    type Handle: LineHandle;

    /// Resolves `line_id` and requests it with the given direction. Output
    /// lines start driven low.
    fn request_line(&self, line_id: u32, direction: Direction)
    -> Result<Self::Handle, HardwareError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub line_id: u32,
    pub value: bool,
    pub timestamp_ms: u64,
}

impl ChangeEvent {
    pub fn new(line_id: u32, value: bool) -> Self {
        Self {
            line_id,
            value,
            timestamp_ms: epoch_millis(),
        }
    }
}

/// Invoked after every committed write, while the line table is still held.
/// Implementations must not block.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

struct LineState<H> {
    direction: Direction,
    value: bool,
    handle: H,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineSnapshot {
    pub id: u32,
    pub direction: Direction,
    /// Last commanded level. Input lines are never cached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<bool>,
}

/// Outcome of driving every output low on shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub safed: Vec<u32>,
    pub failed: Vec<(u32, String)>,
}

struct LineTable<H> {
    lines: FxHashMap<u32, LineState<H>>,
    /// Set by the shutdown drain; no line may be configured or driven after.
    sealed: bool,
}

pub struct PinManager<B: LineBackend> {
    backend: Arc<B>,
    table: RwLock<LineTable<B::Handle>>,
    observers: RwLock<Vec<Arc<dyn ChangeObserver>>>,
}

impl<B: LineBackend> PinManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            table: RwLock::new(LineTable {
                lines: FxHashMap::default(),
                sealed: false,
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Configures `line_id`, replacing any existing entry. The value resets
    /// to low.
    ///
    /// Fails with `ShuttingDown`, `LineNotFound` or `HardwareConfigureFailed`.
    /// In the last two cases a previous entry for the line is gone:
    /// reconfiguration is destroy then recreate, and the old hardware request
    /// is released before the new one is made.
    pub fn configure(&self, line_id: u32, direction: Direction) -> Result<(), AppError> {
        let mut table = self.table.write();
        if table.sealed {
            return Err(AppError::ShuttingDown);
        }

        if let Some(previous) = table.lines.remove(&line_id) {
            debug!(
                "releasing line {line_id} ({}) for reconfiguration",
                previous.direction
            );
            drop(previous);
        }

        let handle = self
            .backend
            .request_line(line_id, direction)
            .map_err(|e| match e {
                HardwareError::UnknownLine(id) => AppError::LineNotFound(id),
                HardwareError::Fault(msg) => {
                    warn!("configure line {line_id} as {direction} failed: {msg}");
                    AppError::HardwareConfigureFailed(msg)
                }
            })?;

        table.lines.insert(
            line_id,
            LineState {
                direction,
                value: false,
                handle,
            },
        );
        info!("line {line_id} configured as {direction}");

        Ok(())
    }

    /// Drives an output line. Observers see the change only once the hardware
    /// accepted it; on a hardware fault the table is untouched.
    ///
    /// Fails with `ShuttingDown`, `LineNotConfigured`, `WrongDirection` or
    /// `HardwareWriteFailed`.
    pub fn write(&self, line_id: u32, value: bool) -> Result<(), AppError> {
        let mut table = self.table.write();
        if table.sealed {
            return Err(AppError::ShuttingDown);
        }
        let line = table
            .lines
            .get_mut(&line_id)
            .ok_or(AppError::LineNotConfigured(line_id))?;

        if line.direction != Direction::Output {
            return Err(AppError::WrongDirection {
                line_id,
                direction: line.direction,
            });
        }

        line.handle.write(value).map_err(|e| {
            warn!("write line {line_id} failed: {e}");
            AppError::HardwareWriteFailed(e.to_string())
        })?;
        line.value = value;

        // published under the table lock so per-line event order is commit order
        self.notify(&ChangeEvent::new(line_id, value));

        Ok(())
    }

    /// Reads an input line live from the hardware.
    ///
    /// Fails with `LineNotConfigured`, `WrongDirection` or
    /// `HardwareReadFailed`.
    pub fn read(&self, line_id: u32) -> Result<bool, AppError> {
        let table = self.table.read();
        let line = table
            .lines
            .get(&line_id)
            .ok_or(AppError::LineNotConfigured(line_id))?;

        if line.direction != Direction::Input {
            return Err(AppError::WrongDirection {
                line_id,
                direction: line.direction,
            });
        }

        line.handle.read().map_err(|e| {
            warn!("read line {line_id} failed: {e}");
            AppError::HardwareReadFailed(e.to_string())
        })
    }

    pub fn register_observer(&self, observer: Arc<dyn ChangeObserver>) {
        self.observers.write().push(observer);
    }

    pub fn snapshot(&self) -> FxHashMap<u32, LineSnapshot> {
        self.table
            .read()
            .lines
            .iter()
            .map(|(id, line)| {
                let value = match line.direction {
                    Direction::Output => Some(line.value),
                    Direction::Input => None,
                };
                (
                    *id,
                    LineSnapshot {
                        id: *id,
                        direction: line.direction,
                        value,
                    },
                )
            })
            .collect()
    }

    /// Takes the table exclusively, seals it against further configure and
    /// write calls, and commands every output line low, carrying on past
    /// per-line failures. Returns `None` if the table could not be acquired
    /// within `timeout`.
    pub fn drive_outputs_low(&self, timeout: Duration) -> Option<DrainReport> {
        let mut table = self.table.try_write_for(timeout)?;
        table.sealed = true;

        let mut outputs: Vec<u32> = table
            .lines
            .iter()
            .filter(|(_, line)| line.direction == Direction::Output)
            .map(|(id, _)| *id)
            .collect();
        outputs.sort_unstable();

        let mut report = DrainReport::default();
        for line_id in outputs {
            let Some(line) = table.lines.get_mut(&line_id) else {
                continue;
            };
            match line.handle.write(false) {
                Ok(()) => {
                    line.value = false;
                    debug!("line {line_id} driven low");
                    report.safed.push(line_id);
                }
                Err(e) => {
                    error!("failed to drive line {line_id} low during drain: {e}");
                    report.failed.push((line_id, e.to_string()));
                }
            }
        }

        Some(report)
    }

    /// True once the shutdown drain has taken the table.
    pub fn is_sealed(&self) -> bool {
        self.table.read().sealed
    }

    fn notify(&self, event: &ChangeEvent) {
        for observer in self.observers.read().iter() {
            observer.on_change(event);
        }
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
