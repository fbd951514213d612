//! Status record and node identity.
//!
//! The status record is serialised once per wake cycle: armed as the MQTT
//! Last Will before connecting, and re-published retained on the same
//! topic at the end of the cycle to mean "online now". Identity (client
//! id, topics) is derived from the configured node name and the factory
//! MAC address.

use core::fmt::Write as _;

use serde::Serialize;

use crate::config::firmware_version;
use crate::power::Power;

/// Full 6-byte factory MAC address.
pub type MacAddress = [u8; 6];

/// Read the factory MAC address from eFuse.
#[cfg(target_os = "espidf")]
pub fn read_mac() -> MacAddress {
    let mut mac: MacAddress = [0u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_efuse_mac_get_default(mac.as_mut_ptr());
    }
    mac
}

/// Simulation: returns a deterministic fake MAC.
#[cfg(not(target_os = "espidf"))]
pub fn read_mac() -> MacAddress {
    [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE]
}

/// Free heap in bytes, reported for fleet diagnostics.
#[cfg(target_os = "espidf")]
pub fn free_heap() -> u32 {
    unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
}

#[cfg(not(target_os = "espidf"))]
pub fn free_heap() -> u32 {
    180_000
}

/// MQTT client id: `<node_name>-<hex mac>`.
pub fn client_id(node_name: &str, mac: &MacAddress) -> heapless::String<96> {
    let mut id = heapless::String::new();
    let _ = write!(id, "{}-", node_name);
    for byte in mac {
        let _ = write!(id, "{:02x}", byte);
    }
    id
}

/// Retained status/LWT topic for this node.
pub fn lwt_topic(node_name: &str) -> String {
    format!("displays/{}/lwt", node_name)
}

/// Retained OTA directive topic for this node.
pub fn ota_topic(node_name: &str) -> String {
    format!("displays/{}/rx", node_name)
}

/// One status message, published as will and as online heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub battery_percentage: i32,
    pub battery_voltage: f32,
    pub charge_rate: f32,
    pub battery_sensor_present: bool,
    pub rssi: i32,
    pub sleep_time: i32,
    pub firmware_version: &'static str,
    pub free_heap: u32,
}

impl StatusRecord {
    pub fn collect(power: &Power, rssi: i32, sleep_hours: i32) -> Self {
        Self {
            battery_percentage: power.battery_percentage(),
            battery_voltage: power.battery_voltage(),
            charge_rate: power.charge_rate(),
            battery_sensor_present: power.battery_sensor_present(),
            rssi,
            sleep_time: sleep_hours,
            firmware_version: firmware_version(),
            free_heap: free_heap(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_appends_hex_mac() {
        let mac = [0x00, 0x11, 0x22, 0xAA, 0xBB, 0xCC];
        assert_eq!(client_id("n1", &mac).as_str(), "n1-001122aabbcc");
    }

    #[test]
    fn topics_embed_the_node_name() {
        assert_eq!(lwt_topic("n1"), "displays/n1/lwt");
        assert_eq!(ota_topic("n1"), "displays/n1/rx");
    }

    #[test]
    fn status_record_serialises_all_fields() {
        let mut power = Power::new();
        power.init_battery_sensor();
        let record = StatusRecord::collect(&power, -58, 2);
        let json = record.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["battery_percentage"], 50);
        assert_eq!(value["battery_sensor_present"], false);
        assert_eq!(value["rssi"], -58);
        assert_eq!(value["sleep_time"], 2);
        assert!(value["firmware_version"].is_string());
        assert!(value["free_heap"].as_u64().unwrap() > 0);
    }

    #[test]
    fn sim_mac_is_deterministic() {
        assert_eq!(read_mac(), read_mac());
    }
}
