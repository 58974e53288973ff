//! Sensor sources
//!
//! [`SensorSource`] is the seam between value generation and the transports.
//! Two sources ship here: [`RandomSensor`] draws uniform readings within its
//! range, and [`ManualSensor`] takes values pushed in by the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::Record;

/// Something that produces numeric readings
pub trait SensorSource: Send + Sync {
    /// Sensor name, used as the record's `name` field
    fn name(&self) -> &str;

    /// Take one reading
    fn read(&self) -> Result<f64>;

    /// Take a reading and wrap it in a timestamped record
    fn to_record(&self) -> Result<Record> {
        let value = self.read()?;
        Ok(Record::stamped().with("name", self.name()).with("value", value))
    }
}

impl<S: SensorSource + ?Sized> SensorSource for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&self) -> Result<f64> {
        (**self).read()
    }

    fn to_record(&self) -> Result<Record> {
        (**self).to_record()
    }
}

fn check_range(min: f64, max: f64) -> Result<()> {
    if !(min.is_finite() && max.is_finite()) || min >= max {
        return Err(Error::InvalidValue(format!(
            "sensor range [{}, {}] is empty or not finite",
            min, max
        )));
    }
    Ok(())
}

/// Simulated sensor drawing uniform readings from `min..=max`.
///
/// Readings are rounded to two decimal places.
#[derive(Debug)]
pub struct RandomSensor {
    name: String,
    min: f64,
    max: f64,
    rng: parking_lot::Mutex<fastrand::Rng>,
}

impl RandomSensor {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Result<Self> {
        Self::with_rng(name, min, max, fastrand::Rng::new())
    }

    /// Reproducible sequence of readings
    pub fn with_seed(name: impl Into<String>, min: f64, max: f64, seed: u64) -> Result<Self> {
        Self::with_rng(name, min, max, fastrand::Rng::with_seed(seed))
    }

    fn with_rng(name: impl Into<String>, min: f64, max: f64, rng: fastrand::Rng) -> Result<Self> {
        check_range(min, max)?;
        Ok(Self {
            name: name.into(),
            min,
            max,
            rng: parking_lot::Mutex::new(rng),
        })
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }
}

impl SensorSource for RandomSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> Result<f64> {
        let unit = self.rng.lock().f64();
        let value = ((self.min + unit * (self.max - self.min)) * 100.0).round() / 100.0;
        Ok(value.clamp(self.min, self.max))
    }

    fn to_record(&self) -> Result<Record> {
        let value = self.read()?;
        Ok(Record::stamped()
            .with("name", self.name.as_str())
            .with("value", value)
            .with("min", self.min)
            .with("max", self.max)
            .with("mode", "random"))
    }
}

/// Sensor whose value is set by the caller
#[derive(Debug)]
pub struct ManualSensor {
    name: String,
    min: f64,
    max: f64,
    value: parking_lot::Mutex<Option<f64>>,
}

impl ManualSensor {
    /// Create a sensor accepting values in `min..=max`
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Result<Self> {
        check_range(min, max)?;

        Ok(Self {
            name: name.into(),
            min,
            max,
            value: parking_lot::Mutex::new(None),
        })
    }

    /// Set the next reading
    pub fn set_value(&self, value: f64) -> Result<()> {
        if !(self.min..=self.max).contains(&value) {
            return Err(Error::InvalidValue(format!(
                "value {} outside [{}, {}] for sensor `{}`",
                value, self.min, self.max, self.name
            )));
        }
        *self.value.lock() = Some(value);
        Ok(())
    }

    pub fn range(&self) -> (f64, f64) {
        (self.min, self.max)
    }
}

impl SensorSource for ManualSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> Result<f64> {
        self.value.lock().ok_or_else(|| {
            Error::InvalidValue(format!("no value set for sensor `{}`", self.name))
        })
    }

    fn to_record(&self) -> Result<Record> {
        let value = self.read()?;
        Ok(Record::stamped()
            .with("name", self.name.as_str())
            .with("value", value)
            .with("min", self.min)
            .with("max", self.max)
            .with("mode", "manual"))
    }
}

/// Named set of sensors read together
#[derive(Default)]
pub struct SensorCollection {
    sensors: BTreeMap<String, Box<dyn SensorSource>>,
}

impl SensorCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sensor, replacing one with the same name
    pub fn add(&mut self, sensor: impl SensorSource + 'static) {
        self.sensors.insert(sensor.name().to_string(), Box::new(sensor));
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.sensors.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&dyn SensorSource> {
        self.sensors.get(name).map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.sensors.keys().cloned().collect()
    }

    /// Read every sensor.
    ///
    /// A sensor that fails yields a record with an `error` field instead.
    pub fn read_all(&self) -> BTreeMap<String, Record> {
        self.sensors
            .iter()
            .map(|(name, sensor)| {
                let record = sensor.to_record().unwrap_or_else(|e| {
                    tracing::debug!(sensor = %name, error = %e, "Sensor read failed");
                    Record::stamped().with("error", Value::String(e.to_string()))
                });
                (name.clone(), record)
            })
            .collect()
    }
}
