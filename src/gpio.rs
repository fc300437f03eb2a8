//! `embedded-hal` digital pins over the Linux sysfs GPIO interface.

use std::convert::Infallible;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use embedded_hal::digital::{ErrorKind, ErrorType, InputPin, OutputPin};
use log::debug;
use thiserror::Error;

const SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Error)]
#[error("gpio{pin}: {source}")]
pub struct GpioError {
    pin: u32,
    #[source]
    source: io::Error,
}

impl embedded_hal::digital::Error for GpioError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

#[derive(Debug)]
pub struct SysfsPin {
    number: u32,
    value: PathBuf,
}

impl SysfsPin {
    pub fn output(number: u32) -> Result<Self, GpioError> {
        Self::open(Path::new(SYSFS_ROOT), number, "out")
    }

    pub fn input(number: u32) -> Result<Self, GpioError> {
        Self::open(Path::new(SYSFS_ROOT), number, "in")
    }

    fn open(root: &Path, number: u32, direction: &str) -> Result<Self, GpioError> {
        let wrap = |source| GpioError {
            pin: number,
            source,
        };
        let dir = root.join(format!("gpio{number}"));
        if !dir.exists() {
            debug!("Exporting gpio{}", number);
            fs::write(root.join("export"), number.to_string()).map_err(wrap)?;
        }
        fs::write(dir.join("direction"), direction).map_err(wrap)?;
        Ok(SysfsPin {
            number,
            value: dir.join("value"),
        })
    }

    fn write(&self, level: &str) -> Result<(), GpioError> {
        fs::write(&self.value, level).map_err(|source| GpioError {
            pin: self.number,
            source,
        })
    }

    fn read(&self) -> Result<bool, GpioError> {
        let raw = fs::read_to_string(&self.value).map_err(|source| GpioError {
            pin: self.number,
            source,
        })?;
        Ok(raw.trim() == "1")
    }
}

impl ErrorType for SysfsPin {
    type Error = GpioError;
}

impl OutputPin for SysfsPin {
    fn set_low(&mut self) -> Result<(), GpioError> {
        self.write("0")
    }

    fn set_high(&mut self) -> Result<(), GpioError> {
        self.write("1")
    }
}

impl InputPin for SysfsPin {
    fn is_high(&mut self) -> Result<bool, GpioError> {
        self.read()
    }

    fn is_low(&mut self) -> Result<bool, GpioError> {
        self.read().map(|high| !high)
    }
}

/// Output that goes nowhere, for nodes running without hardware.
#[derive(Debug, Default)]
pub struct NoopPin;

impl ErrorType for NoopPin {
    type Error = Infallible;
}

impl OutputPin for NoopPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        debug!("(noop) pin low");
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        debug!("(noop) pin high");
        Ok(())
    }
}
