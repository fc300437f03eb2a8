use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use embedded_hal::digital::InputPin;
use log::{debug, error, warn};

use crate::error::SensorError;
use crate::model::Reading;

/// Attempts per sampling cycle before the cycle is given up.
pub const MAX_ATTEMPTS: usize = 10;

/// DHT sensors need this long between conversions.
const SETTLE: Duration = Duration::from_secs(2);

const EIO: i32 = 5;

/// Temperature/humidity source. One call is one physical read.
pub trait ClimateSensor {
    /// Reads `(temperature °C, humidity %RH)`. With `settle` set the sensor
    /// first waits out its settle time, which can take a couple of seconds.
    fn read(&mut self, settle: bool) -> Result<(f32, f32), SensorError>;
}

impl<S: ClimateSensor + ?Sized> ClimateSensor for Box<S> {
    fn read(&mut self, settle: bool) -> Result<(f32, f32), SensorError> {
        (**self).read(settle)
    }
}

pub trait MotionSensor {
    /// Whether motion is being detected right now.
    fn motion(&mut self) -> bool;
}

/// Tries the sensor up to [`MAX_ATTEMPTS`] times. Only the first attempt
/// skips the settle wait.
pub fn sample<S: ClimateSensor + ?Sized>(sensor: &mut S) -> Option<Reading> {
    for attempt in 0..MAX_ATTEMPTS {
        match sensor.read(attempt > 0) {
            Ok((temp, humidity)) => {
                return Some(Reading {
                    temp,
                    humidity,
                    time: Utc::now(),
                });
            }
            Err(err) => debug!("Sensor attempt {} failed: {}", attempt + 1, err),
        }
    }
    warn!("Sensor failed {} times, skipping this sample", MAX_ATTEMPTS);
    None
}

/// Reports the same values forever. Used when no sensor is attached.
#[derive(Debug, Clone, Copy)]
pub struct FixedSensor {
    temp: f32,
    humidity: f32,
}

impl FixedSensor {
    pub fn new(temp: f32, humidity: f32) -> Self {
        FixedSensor { temp, humidity }
    }
}

impl Default for FixedSensor {
    fn default() -> Self {
        FixedSensor::new(20.0, 50.0)
    }
}

impl ClimateSensor for FixedSensor {
    fn read(&mut self, _settle: bool) -> Result<(f32, f32), SensorError> {
        Ok((self.temp, self.humidity))
    }
}

/// DHT11/DHT22 behind the kernel `dht11` IIO driver, e.g.
/// `/sys/bus/iio/devices/iio:device0`. Channels are in thousandths.
#[derive(Debug, Clone)]
pub struct IioSensor {
    dir: PathBuf,
    settle: Duration,
}

impl IioSensor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        IioSensor {
            dir: dir.into(),
            settle: SETTLE,
        }
    }

    fn channel(&self, name: &str) -> Result<f32, SensorError> {
        let raw = fs::read_to_string(self.dir.join(name)).map_err(classify)?;
        let milli: i32 = raw.trim().parse().map_err(|_| SensorError::Checksum)?;
        Ok(milli as f32 / 1000.0)
    }
}

impl ClimateSensor for IioSensor {
    fn read(&mut self, settle: bool) -> Result<(f32, f32), SensorError> {
        if settle {
            thread::sleep(self.settle);
        }
        let temp = self.channel("in_temp_input")?;
        let humidity = self.channel("in_humidityrelative_input")?;
        Ok((temp, humidity))
    }
}

// The driver fails a bad checksum with EIO and a missed edge with ETIMEDOUT.
fn classify(err: io::Error) -> SensorError {
    if err.kind() == io::ErrorKind::TimedOut {
        SensorError::Timing
    } else if err.raw_os_error() == Some(EIO) {
        SensorError::Checksum
    } else {
        SensorError::Unavailable
    }
}

/// PIR-style motion sensor on a digital input, high while motion is seen.
pub struct PinMotion<P> {
    pin: P,
}

impl<P: InputPin> PinMotion<P> {
    pub fn new(pin: P) -> Self {
        PinMotion { pin }
    }
}

impl<P: InputPin> MotionSensor for PinMotion<P> {
    fn motion(&mut self) -> bool {
        match self.pin.is_high() {
            Ok(high) => high,
            Err(err) => {
                error!("Error reading motion pin: {:?}", err);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gpio::tests::MockPin;
    use std::collections::VecDeque;

    /// Replays queued results, then reports the sensor as unavailable.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedSensor {
        pub results: VecDeque<Result<(f32, f32), SensorError>>,
        pub settles: Vec<bool>,
    }

    impl ScriptedSensor {
        pub fn new(results: impl IntoIterator<Item = Result<(f32, f32), SensorError>>) -> Self {
            ScriptedSensor {
                results: results.into_iter().collect(),
                settles: Vec::new(),
            }
        }
    }

    impl ClimateSensor for ScriptedSensor {
        fn read(&mut self, settle: bool) -> Result<(f32, f32), SensorError> {
            self.settles.push(settle);
            self.results
                .pop_front()
                .unwrap_or(Err(SensorError::Unavailable))
        }
    }

    #[test]
    fn test_sample_retries_until_success() {
        let mut sensor = ScriptedSensor::new([
            Err(SensorError::Checksum),
            Err(SensorError::Timing),
            Ok((21.5, 44.0)),
        ]);
        let reading = sample(&mut sensor).unwrap();
        assert_eq!(reading.temp, 21.5);
        assert_eq!(reading.humidity, 44.0);
        assert_eq!(sensor.settles, vec![false, true, true]);
    }

    #[test]
    fn test_sample_gives_up_after_max_attempts() {
        let mut sensor = ScriptedSensor::default();
        assert!(sample(&mut sensor).is_none());
        assert_eq!(sensor.settles.len(), MAX_ATTEMPTS);
    }

    #[test]
    fn test_fixed_sensor() {
        let mut sensor = FixedSensor::default();
        assert_eq!(sensor.read(true), Ok((20.0, 50.0)));
    }

    #[test]
    fn test_iio_sensor_reads_channels() {
        let dir = std::env::temp_dir().join(format!("refuge-iio-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("in_temp_input"), "21500\n").unwrap();
        fs::write(dir.join("in_humidityrelative_input"), "44200\n").unwrap();

        let mut sensor = IioSensor::new(&dir);
        sensor.settle = Duration::ZERO;
        assert_eq!(sensor.read(true), Ok((21.5, 44.2)));

        fs::write(dir.join("in_humidityrelative_input"), "garbage").unwrap();
        assert_eq!(sensor.read(false), Err(SensorError::Checksum));

        fs::remove_dir_all(&dir).unwrap();
        assert_eq!(sensor.read(false), Err(SensorError::Unavailable));
    }

    #[test]
    fn test_driver_errors_are_classified() {
        assert_eq!(classify(io::Error::from_raw_os_error(EIO)), SensorError::Checksum);
        assert_eq!(
            classify(io::Error::from(io::ErrorKind::TimedOut)),
            SensorError::Timing
        );
        assert_eq!(
            classify(io::Error::from(io::ErrorKind::NotFound)),
            SensorError::Unavailable
        );
    }

    #[test]
    fn test_pin_motion() {
        let mut motion = PinMotion::new(MockPin::default());
        assert!(!motion.motion());
        motion.pin.high = true;
        assert!(motion.motion());
    }
}
