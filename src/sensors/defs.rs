//! Sensor definitions loaded from YAML files.
//!
//! Each file in the sensors directory describes one sensor model: the bus
//! and device id it is found at, and the list of values it exposes together
//! with how to read them back (sysfs file or shell command plus a regex
//! capture and linear scaling).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DefsError {
    #[error("wrong bus: '{0}'")]
    WrongBus(String),
    #[error("error compiling regexp '{re}': {source}")]
    BadRegex { re: String, source: regex::Error },
    #[error("error reading file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("error parsing file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Hardware bus a sensor is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bus {
    W1,
    I2c,
}

impl FromStr for Bus {
    type Err = DefsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "w1" | "1wire" | "1-wire" => Ok(Bus::W1),
            "i2c" | "iic" | "twi" => Ok(Bus::I2c),
            other => Err(DefsError::WrongBus(other.to_string())),
        }
    }
}

impl fmt::Display for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bus::W1 => write!(f, "w1"),
            Bus::I2c => write!(f, "i2c"),
        }
    }
}

/// Expected value range, reported over the API as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DataRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ValueYaml {
    name: String,
    range: DataRange,
    /// Minimum sampling interval, milliseconds.
    resolution: u64,
    file: String,
    command: String,
    re: String,
    multiplier: f64,
    addend: f64,
}

impl Default for ValueYaml {
    fn default() -> Self {
        Self {
            name: String::new(),
            range: DataRange::default(),
            resolution: 0,
            file: String::new(),
            command: String::new(),
            re: String::new(),
            multiplier: 1.0,
            addend: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DeviceYaml {
    bus: String,
    id: u64,
    driver: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SensorYaml {
    name: String,
    values: Vec<ValueYaml>,
    device: DeviceYaml,
}

/// One readable value of a sensor, with compiled readback rules.
#[derive(Debug, Clone)]
pub struct ValueDef {
    pub name: String,
    pub range: DataRange,
    pub resolution: Duration,
    pub file: String,
    pub command: String,
    pub re: Regex,
    pub multiplier: f64,
    pub addend: f64,
}

#[derive(Debug, Clone)]
pub struct DeviceDef {
    pub bus: Bus,
    pub id: u64,
    pub driver: String,
}

/// A sensor model definition.
#[derive(Debug, Clone)]
pub struct SensorDef {
    pub name: String,
    pub values: Vec<ValueDef>,
    pub device: DeviceDef,
}

fn compile_value(v: ValueYaml) -> Result<ValueDef, DefsError> {
    let re = if v.re.is_empty() {
        Regex::new(".*").expect("literal regex")
    } else {
        Regex::new(&v.re).map_err(|source| DefsError::BadRegex { re: v.re.clone(), source })?
    };
    let multiplier = if v.multiplier.abs() > f64::MIN_POSITIVE {
        v.multiplier
    } else {
        1.0
    };
    Ok(ValueDef {
        name: v.name,
        range: v.range,
        resolution: Duration::from_millis(v.resolution),
        file: v.file,
        command: v.command,
        re,
        multiplier,
        addend: v.addend,
    })
}

fn compile_sensor(s: SensorYaml) -> Result<SensorDef, DefsError> {
    let values = s
        .values
        .into_iter()
        .map(compile_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SensorDef {
        name: s.name,
        values,
        device: DeviceDef {
            bus: s.device.bus.parse()?,
            id: s.device.id,
            driver: s.device.driver,
        },
    })
}

/// Parse a single sensor definition from YAML text.
pub fn parse_sensor_def(text: &str, path: &str) -> Result<SensorDef, DefsError> {
    let raw: SensorYaml = serde_yaml::from_str(text).map_err(|source| DefsError::Parse {
        path: path.to_string(),
        source,
    })?;
    compile_sensor(raw)
}

/// Load all `*.yml` sensor definitions from a directory.
///
/// Unreadable or malformed files are logged and skipped, matching the
/// behavior of the rest of the configuration layer: a broken definition must
/// not keep the daemon from starting.
pub fn load_sensor_defs<P: AsRef<Path>>(dir: P) -> Vec<SensorDef> {
    let dir = dir.as_ref();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(err) => {
            tracing::warn!("error reading sensors directory '{}': {}", dir.display(), err);
            return Vec::new();
        }
    };

    let mut defs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yml") {
            continue;
        }
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(err) => {
                tracing::warn!("error reading file '{}': {}", path.display(), err);
                continue;
            }
        };
        match parse_sensor_def(&text, &path.display().to_string()) {
            Ok(def) => defs.push(def),
            Err(err) => tracing::warn!("error loading sensor definition: {}", err),
        }
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;

    const DS18B20: &str = r#"
name: ds18b20
device:
  bus: w1
  id: 0x28
values:
  - name: temperature
    range: { min: -55.0, max: 125.0 }
    resolution: 750
    re: "t=(-?\\d+)"
    multiplier: 0.001
"#;

    #[test]
    fn parses_w1_sensor() {
        let def = parse_sensor_def(DS18B20, "ds18b20.yml").unwrap();
        assert_eq!(def.name, "ds18b20");
        assert_eq!(def.device.bus, Bus::W1);
        assert_eq!(def.device.id, 0x28);
        assert_eq!(def.values.len(), 1);
        let v = &def.values[0];
        assert_eq!(v.name, "temperature");
        assert_eq!(v.resolution, Duration::from_millis(750));
        assert_eq!(v.multiplier, 0.001);
        assert!(v.re.is_match("t=21312"));
    }

    #[test]
    fn zero_multiplier_becomes_identity() {
        let yaml = "name: x\ndevice: { bus: i2c, id: 0x40 }\nvalues:\n  - name: v\n";
        let def = parse_sensor_def(yaml, "x.yml").unwrap();
        assert_eq!(def.values[0].multiplier, 1.0);
        assert!(def.values[0].re.is_match("anything"));
    }

    #[test]
    fn rejects_unknown_bus() {
        let yaml = "name: x\ndevice: { bus: spi, id: 1 }\n";
        assert!(parse_sensor_def(yaml, "x.yml").is_err());
    }

    #[test]
    fn bus_aliases() {
        assert_eq!("1-wire".parse::<Bus>().unwrap(), Bus::W1);
        assert_eq!("TWI".parse::<Bus>().unwrap(), Bus::I2c);
    }
}
