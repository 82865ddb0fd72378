use std::path::PathBuf;

use libgpiod::{chip::Chip, line, request};
use parking_lot::FairMutex;
use rustc_hash::FxHashMap;

use crate::config::{AppConfig, LineConfig};
use crate::error::HardwareError;
use crate::gpio::{Direction, LineBackend, LineHandle};

pub struct LibgpiodBackend {
    lines: FxHashMap<u32, LineConfig>, // keyed by line id
}

/// One line request on a chip. The request is released when dropped.
pub struct LibgpiodLine {
    offset: u32,
    request: FairMutex<request::Request>,
}

impl LibgpiodBackend {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            lines: config.gpios.clone(),
        }
    }

    fn open_chip(path: &str) -> Result<Chip, HardwareError> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| HardwareError::Fault(format!("open chip {path}: {e}")))
    }

    fn request_lines(
        chip: &Chip,
        line_cfg: &line::Config,
    ) -> Result<request::Request, HardwareError> {
        let mut req_cfg = request::Config::new()
            .map_err(|e| HardwareError::Fault(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| HardwareError::Fault(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| HardwareError::Fault(format!("request lines: {e}")))
    }

    fn make_line_settings(direction: Direction) -> Result<line::Settings, HardwareError> {
        let mut ls = line::Settings::new()
            .map_err(|e| HardwareError::Fault(format!("libgpiod settings: {e}")))?;

        match direction {
            Direction::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| HardwareError::Fault(format!("set direction: {e}")))?;
                ls.set_output_value(line::Value::InActive)
                    .map_err(|e| HardwareError::Fault(format!("set output value: {e}")))?;
            }
            Direction::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| HardwareError::Fault(format!("set direction: {e}")))?;
                ls.set_bias(Some(line::Bias::PullUp))
                    .map_err(|e| HardwareError::Fault(format!("set bias: {e}")))?;
            }
        }

        Ok(ls)
    }

    fn make_line_config(
        offset: u32,
        settings: line::Settings,
    ) -> Result<line::Config, HardwareError> {
        let mut cfg = line::Config::new()
            .map_err(|e| HardwareError::Fault(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| HardwareError::Fault(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }
}

impl LineBackend for LibgpiodBackend {
    type Handle = LibgpiodLine;

    fn request_line(
        &self,
        line_id: u32,
        direction: Direction,
    ) -> Result<Self::Handle, HardwareError> {
        let cfg = self
            .lines
            .get(&line_id)
            .ok_or(HardwareError::UnknownLine(line_id))?;

        let line_settings = Self::make_line_settings(direction)?;
        let line_cfg = Self::make_line_config(cfg.line, line_settings)?;
        let chip = Self::open_chip(&cfg.chip)?;
        let request = Self::request_lines(&chip, &line_cfg)?;

        Ok(LibgpiodLine {
            offset: cfg.line,
            request: FairMutex::new(request),
        })
    }
}

impl LineHandle for LibgpiodLine {
    fn write(&mut self, level: bool) -> Result<(), HardwareError> {
        let value = if level {
            line::Value::Active
        } else {
            line::Value::InActive
        };
        self.request
            .get_mut()
            .set_value(self.offset, value)
            .map_err(|e| HardwareError::Fault(format!("set value: {e}")))?;
        Ok(())
    }

    fn read(&self) -> Result<bool, HardwareError> {
        let value = self
            .request
            .lock()
            .value(self.offset)
            .map_err(|e| HardwareError::Fault(format!("get value: {e}")))?;
        Ok(matches!(value, line::Value::Active))
    }
}
