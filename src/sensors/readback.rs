//! Value readback: sysfs files, shell commands, regex extraction, scaling.

use super::defs::Bus;
use super::{PluggedSensor, SensorError};
use std::path::Path;
use std::process::Command;

/// Read the `idx`-th value of a plugged sensor.
///
/// Blocking; callers sample through `spawn_blocking`.
pub fn read_value(sensor: &PluggedSensor, idx: usize) -> Result<f64, SensorError> {
    let value = &sensor.def.values[idx];

    let raw = if !value.command.is_empty() {
        let cmd = substitute(&value.command, sensor);
        let out = Command::new("/bin/sh")
            .arg("-c")
            .arg(&cmd)
            .output()
            .map_err(|e| SensorError::Read(format!("'{}': {}", cmd, e)))?;
        if !out.status.success() {
            return Err(SensorError::Read(format!("'{}': {}", cmd, out.status)));
        }
        out.stdout
    } else if Path::new(&value.file).is_absolute() {
        // absolute path readback, mainly for debugging
        std::fs::read(&value.file)
            .map_err(|e| SensorError::Read(format!("cannot read file '{}': {}", value.file, e)))?
    } else {
        let file = device_file(sensor, &value.file)?;
        std::fs::read(&file)
            .map_err(|e| SensorError::Read(format!("cannot read file '{}': {}", file, e)))?
    };

    let text = String::from_utf8_lossy(&raw);
    let captured = match value.re.captures(&text) {
        None => return Err(SensorError::Read("no data received".to_string())),
        Some(caps) => caps
            .get(1)
            .or_else(|| caps.get(0))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default(),
    };

    let data: f64 = captured
        .trim()
        .parse()
        .map_err(|e| SensorError::Read(format!("cannot parse data '{}': {}", captured, e)))?;

    Ok(data * value.multiplier + value.addend)
}

/// Expand `${typ}`, `${addr}` and `${bus}` placeholders in a command.
fn substitute(command: &str, sensor: &PluggedSensor) -> String {
    match sensor.def.device.bus {
        Bus::W1 => {
            let typ = sensor.address & 0xff;
            let addr = sensor.address >> 8;
            command
                .replace("${typ}", &typ.to_string())
                .replace("${addr}", &addr.to_string())
        }
        Bus::I2c => {
            let addr = sensor.address & 0xff;
            let bus = sensor.address >> 8;
            command
                .replace("${bus}", &bus.to_string())
                .replace("${addr}", &addr.to_string())
        }
    }
}

/// Build the sysfs path of a value file relative to the device directory.
fn device_file(sensor: &PluggedSensor, file: &str) -> Result<String, SensorError> {
    match sensor.def.device.bus {
        Bus::W1 => {
            let typ = sensor.address & 0xff;
            let addr = sensor.address >> 8;
            let name = if file.is_empty() { "w1_slave" } else { file };
            Ok(format!("/sys/bus/w1/devices/{:x}-{:012x}/{}", typ, addr, name))
        }
        Bus::I2c => {
            if file.is_empty() {
                return Err(SensorError::Read(
                    "no file nor command specified".to_string(),
                ));
            }
            let addr = sensor.address & 0xff;
            let bus = sensor.address >> 8;
            Ok(format!(
                "/sys/bus/i2c/devices/{}-{:04x}/{}",
                bus, addr, file
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::defs::parse_sensor_def;
    use std::io::Write;
    use std::sync::Arc;

    fn plugged_from(yaml: &str, address: u64) -> PluggedSensor {
        PluggedSensor {
            address,
            def: Arc::new(parse_sensor_def(yaml, "test.yml").unwrap()),
        }
    }

    #[test]
    fn reads_and_scales_from_absolute_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "xx yy : crc ok\nt=21312\n").unwrap();

        let yaml = format!(
            "name: ds18b20\ndevice: {{ bus: w1, id: 0x28 }}\nvalues:\n  - name: temperature\n    file: {}\n    re: \"t=(-?\\\\d+)\"\n    multiplier: 0.001\n",
            file.path().display()
        );
        let sensor = plugged_from(&yaml, 0x1234_28);

        let v = read_value(&sensor, 0).unwrap();
        assert!((v - 21.312).abs() < 1e-9);
    }

    #[test]
    fn missing_match_is_a_read_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "garbage").unwrap();

        let yaml = format!(
            "name: s\ndevice: {{ bus: w1, id: 0x28 }}\nvalues:\n  - name: v\n    file: {}\n    re: \"t=(\\\\d+)\"\n",
            file.path().display()
        );
        let sensor = plugged_from(&yaml, 0x28);
        assert!(matches!(
            read_value(&sensor, 0),
            Err(SensorError::Read(_))
        ));
    }

    #[test]
    fn command_substitution_uses_bus_fields() {
        let yaml = "name: s\ndevice: { bus: i2c, id: 0x40 }\nvalues:\n  - name: v\n    command: \"echo ${bus} ${addr}\"\n";
        let sensor = plugged_from(yaml, (1 << 8) | 0x40);
        assert_eq!(substitute(&sensor.def.values[0].command, &sensor), "echo 1 64");
    }

    #[test]
    fn command_readback_parses_stdout() {
        let yaml = "name: s\ndevice: { bus: i2c, id: 0x40 }\nvalues:\n  - name: v\n    command: \"echo 42.5\"\n    re: \"([0-9.]+)\"\n";
        let sensor = plugged_from(yaml, (1 << 8) | 0x40);
        assert_eq!(read_value(&sensor, 0).unwrap(), 42.5);
    }
}
