//! Coordinator port detection
//!
//! The coordinator is an ESP32 board behind a USB-UART bridge. With the
//! `serial` feature, USB ports are matched by vendor id and product string;
//! otherwise (and as a fallback) common device paths are globbed.

use std::path::Path;
use tracing::{debug, info};

/// Common serial port paths for USB-UART bridges on different platforms
const COMMON_DEVICE_PATHS: &[&str] = &[
    // Linux
    "/dev/ttyUSB*",
    "/dev/ttyACM*",
    "/dev/serial/by-id/usb-Silicon_Labs_CP210x_USB_to_UART_Bridge*",
    "/dev/serial/by-id/usb-1a86_USB_Serial*",
    // macOS
    "/dev/cu.usbserial-*",
    "/dev/cu.SLAB_USBtoUART*",
    "/dev/cu.wchusbserial*",
    "/dev/cu.usbmodem*",
];

/// USB vendor ids of bridges found on ESP32 boards
///
/// Silicon Labs CP210x, FTDI, Espressif native USB, WCH CH340.
pub const KNOWN_VENDOR_IDS: &[u16] = &[0x10C4, 0x0403, 0x303A, 0x1A86];

/// Find a connected coordinator
///
/// Returns the path of the first likely port, or `None`.
pub fn find_coordinator_port() -> Option<String> {
    #[cfg(feature = "serial")]
    {
        if let Ok(ports) = serialport::available_ports() {
            for port in ports {
                if is_likely_coordinator_port(&port) {
                    info!(port = %port.port_name, "Found likely coordinator");
                    return Some(port.port_name);
                }
            }
        }
    }

    let found = glob_common_paths();
    if let Some(path) = &found {
        info!(port = %path, "Found serial port by path");
    }
    found
}

fn glob_common_paths() -> Option<String> {
    for pattern in COMMON_DEVICE_PATHS {
        let Ok(entries) = glob::glob(pattern) else {
            continue;
        };
        for entry in entries.flatten() {
            if entry.exists() {
                let path = entry.to_string_lossy().to_string();
                debug!(port = %path, "Serial port candidate");
                return Some(path);
            }
        }
    }
    None
}

/// Whether a product string names a USB-UART bridge or an ESP32 board
pub fn is_likely_product(product: &str) -> bool {
    let product = product.to_lowercase();
    ["cp210", "ch340", "ch9102", "uart", "esp32", "usb serial", "jtag"]
        .iter()
        .any(|needle| product.contains(needle))
}

#[cfg(feature = "serial")]
fn is_likely_coordinator_port(port: &serialport::SerialPortInfo) -> bool {
    use serialport::SerialPortType;

    match &port.port_type {
        SerialPortType::UsbPort(usb_info) => {
            if KNOWN_VENDOR_IDS.contains(&usb_info.vid) {
                debug!(
                    vid = format!("{:#06X}", usb_info.vid),
                    pid = format!("{:#06X}", usb_info.pid),
                    "USB device matches known vendor"
                );
                return true;
            }
            usb_info.product.as_deref().is_some_and(is_likely_product)
        }
        _ => false,
    }
}

/// Information about a detected serial device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Path to the device (e.g., /dev/ttyUSB0)
    pub path: String,
    /// Device type description
    pub device_type: String,
    /// USB Vendor ID (if available)
    pub vendor_id: Option<u16>,
    /// USB Product ID (if available)
    pub product_id: Option<u16>,
    /// Product name (if available)
    pub product_name: Option<String>,
    /// Whether this is likely the coordinator
    pub is_likely_coordinator: bool,
}

impl DeviceInfo {
    #[cfg(feature = "serial")]
    fn from_serial_port(port: &serialport::SerialPortInfo) -> Self {
        use serialport::SerialPortType;

        let (device_type, vendor_id, product_id, product_name) = match &port.port_type {
            SerialPortType::UsbPort(usb_info) => (
                "USB",
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.product.clone(),
            ),
            SerialPortType::PciPort => ("PCI", None, None, None),
            SerialPortType::BluetoothPort => ("Bluetooth", None, None, None),
            SerialPortType::Unknown => ("Unknown", None, None, None),
        };

        Self {
            path: port.port_name.clone(),
            device_type: device_type.to_string(),
            vendor_id,
            product_id,
            product_name,
            is_likely_coordinator: is_likely_coordinator_port(port),
        }
    }

    fn from_path(path: &Path) -> Self {
        Self {
            path: path.to_string_lossy().to_string(),
            device_type: "Unknown".to_string(),
            vendor_id: None,
            product_id: None,
            product_name: None,
            is_likely_coordinator: false,
        }
    }
}

/// List serial ports visible on this machine
pub fn list_available_devices() -> Vec<DeviceInfo> {
    #[cfg(feature = "serial")]
    {
        if let Ok(ports) = serialport::available_ports() {
            return ports.iter().map(DeviceInfo::from_serial_port).collect();
        }
    }

    COMMON_DEVICE_PATHS
        .iter()
        .filter_map(|pattern| glob::glob(pattern).ok())
        .flat_map(|entries| entries.flatten())
        .map(|path| DeviceInfo::from_path(&path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_matching() {
        assert!(is_likely_product("CP2102 USB to UART Bridge Controller"));
        assert!(is_likely_product("USB JTAG/serial debug unit"));
        assert!(!is_likely_product("Logitech Keyboard"));
    }

    #[test]
    fn test_common_patterns_are_valid_globs() {
        for pattern in COMMON_DEVICE_PATHS {
            assert!(glob::Pattern::new(pattern).is_ok(), "{}", pattern);
        }
    }

    #[test]
    fn test_detection_does_not_panic() {
        let _ = find_coordinator_port();
        for device in list_available_devices() {
            assert!(!device.path.is_empty());
        }
    }
}
