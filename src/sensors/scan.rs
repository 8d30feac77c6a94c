//! Sensor discovery over sysfs.
//!
//! 1-Wire devices enumerate under `/sys/bus/w1/devices` as `<family>-<serial>`
//! directories; any number of sensors of the same family can be attached at
//! once. I²C devices are probed per configured bus: one device with a given
//! address per bus, optionally bound to a kernel driver first.

use super::defs::{Bus, SensorDef};
use super::PluggedSensor;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const W1_DEVICES: &str = "/sys/bus/w1/devices";

/// Discover all attached sensors for the given definitions.
pub fn scan(defs: &[Arc<SensorDef>], i2c_buses: &[u32]) -> HashMap<String, PluggedSensor> {
    let mut plugged = HashMap::new();
    for def in defs {
        match def.device.bus {
            Bus::W1 => scan_w1(def, Path::new(W1_DEVICES), &mut plugged),
            Bus::I2c => scan_i2c(def, i2c_buses, &mut plugged),
        }
    }
    plugged
}

/// Match `<family>-<serial>` device directory names for one 1-Wire family.
fn scan_w1(def: &Arc<SensorDef>, devices_dir: &Path, out: &mut HashMap<String, PluggedSensor>) {
    let entries = match std::fs::read_dir(devices_dir) {
        Ok(e) => e,
        Err(err) => {
            tracing::debug!("no 1-Wire bus: {}", err);
            return;
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((family, serial)) = name.split_once('-') else {
            continue;
        };
        let Ok(family) = u64::from_str_radix(family, 16) else {
            continue;
        };
        if family != def.device.id {
            continue;
        }
        let Ok(serial) = u64::from_str_radix(serial, 16) else {
            tracing::warn!("cannot parse 1-Wire slave name '{}'", name);
            continue;
        };
        let address = (serial << 8) | family;
        let id = format!("{}-{:x}", def.name, address);
        tracing::info!(
            "detected 1-Wire sensor {} (family 0x{:x}) at address 0x{:x}; assigned id {}",
            def.name,
            family,
            address,
            id
        );
        out.insert(
            id,
            PluggedSensor {
                address,
                def: def.clone(),
            },
        );
    }
}

/// Probe each configured I²C bus for the definition's device address.
fn scan_i2c(def: &Arc<SensorDef>, buses: &[u32], out: &mut HashMap<String, PluggedSensor>) {
    for &bus in buses {
        let dev_dir = format!("/sys/bus/i2c/devices/{}-{:04x}", bus, def.device.id);
        let mut present = Path::new(&dev_dir).exists();

        if !present && !def.device.driver.is_empty() {
            // ask the kernel to instantiate the device, then re-check
            let new_device = format!("/sys/bus/i2c/devices/i2c-{}/new_device", bus);
            let line = format!("{} 0x{:x}\n", def.device.driver, def.device.id);
            if let Err(err) = std::fs::write(&new_device, line) {
                tracing::debug!("cannot attach i2c device on bus {}: {}", bus, err);
            }
            present = Path::new(&dev_dir).exists();
        }

        if !present {
            continue;
        }

        let address = (u64::from(bus) << 8) | def.device.id;
        let id = format!("{}-{:x}:{:x}", def.name, bus, def.device.id);
        tracing::info!(
            "detected I2C sensor {} at bus 0x{:x}, address 0x{:x}; assigned id {}",
            def.name,
            bus,
            def.device.id,
            id
        );
        out.insert(
            id,
            PluggedSensor {
                address,
                def: def.clone(),
            },
        );
    }
}
