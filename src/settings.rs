//! Persistent settings store.
//!
//! Typed key/value accessors over a single NVS namespace (`epaper`).
//! Writes are committed by NVS so a cold boot after deep sleep observes
//! them. The store is cheaply cloneable: each accessor opens a short-lived
//! namespace handle, serialised by an internal lock.
//!
//! On the host the NVS backend is replaced by a shared in-memory map so
//! the whole wake cycle can run in tests; clones observe each other's
//! writes exactly like NVS handles do.

use log::warn;

use crate::config::{
    DEFAULT_MQTT_PORT, DEFAULT_NODE_NAME, DEFAULT_SLEEP_HOURS, MAX_STRING_LEN, MAX_TOPIC_LEN,
};

#[cfg(not(target_os = "espidf"))]
use std::collections::HashMap;
#[cfg(not(target_os = "espidf"))]
use std::sync::{Arc, Mutex};

#[cfg(target_os = "espidf")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};

// ── Keys ──────────────────────────────────────────────────────

pub const KEY_NODE_NAME: &str = "node_name";
pub const KEY_MQTT_BROKER: &str = "mqtt_broker";
pub const KEY_MQTT_PORT: &str = "mqtt_port";
pub const KEY_MQTT_USER: &str = "mqtt_user";
pub const KEY_MQTT_PASSWORD: &str = "mqtt_password";
pub const KEY_MQTT_TOPIC: &str = "mqtt_topic";
pub const KEY_SLEEP_HOURS: &str = "sleep_hours";
pub const KEY_CONFIG_DONE: &str = "config_done";

/// Every key the firmware ever writes; `clear()` removes exactly these.
const ALL_KEYS: [&str; 8] = [
    KEY_NODE_NAME,
    KEY_MQTT_BROKER,
    KEY_MQTT_PORT,
    KEY_MQTT_USER,
    KEY_MQTT_PASSWORD,
    KEY_MQTT_TOPIC,
    KEY_SLEEP_HOURS,
    KEY_CONFIG_DONE,
];

// ── Store ─────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i32),
    Bool(bool),
}

/// Handle to the persistent settings namespace.
#[derive(Clone)]
pub struct Settings {
    #[cfg(target_os = "espidf")]
    partition: EspDefaultNvsPartition,
    #[cfg(target_os = "espidf")]
    lock: std::sync::Arc<std::sync::Mutex<()>>,
    #[cfg(not(target_os = "espidf"))]
    store: Arc<Mutex<HashMap<String, Value>>>,
}

#[cfg(target_os = "espidf")]
impl Settings {
    /// Open the settings namespace on the default NVS partition.
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            lock: std::sync::Arc::new(std::sync::Mutex::new(())),
        }
    }

    fn with_nvs<T>(&self, f: impl FnOnce(&mut EspNvs<NvsDefault>) -> anyhow::Result<T>) -> Option<T> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = match EspNvs::new(
            self.partition.clone(),
            crate::config::SETTINGS_NAMESPACE,
            true,
        ) {
            Ok(nvs) => nvs,
            Err(err) => {
                warn!("settings: namespace open failed: {err}");
                return None;
            }
        };
        match f(&mut nvs) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("settings: NVS access failed: {err}");
                None
            }
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.with_nvs(|nvs| {
            let mut buf = [0u8; MAX_TOPIC_LEN + 1];
            Ok(nvs.get_str(key, &mut buf)?.map(str::to_owned))
        })
        .flatten()
        .unwrap_or_else(|| default.to_owned())
    }

    pub fn put_string(&self, key: &str, value: &str) {
        let _ = self.with_nvs(|nvs| Ok(nvs.set_str(key, value)?));
    }

    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        self.with_nvs(|nvs| Ok(nvs.get_i32(key)?))
            .flatten()
            .unwrap_or(default)
    }

    pub fn put_int(&self, key: &str, value: i32) {
        let _ = self.with_nvs(|nvs| Ok(nvs.set_i32(key, value)?));
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.with_nvs(|nvs| Ok(nvs.get_u8(key)?))
            .flatten()
            .map_or(default, |v| v != 0)
    }

    pub fn put_bool(&self, key: &str, value: bool) {
        let _ = self.with_nvs(|nvs| Ok(nvs.set_u8(key, u8::from(value))?));
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.with_nvs(|nvs| Ok(nvs.contains(key)?)).unwrap_or(false)
    }

    /// Factory reset: remove every key the firmware owns.
    pub fn clear(&self) {
        let _ = self.with_nvs(|nvs| {
            for key in ALL_KEYS {
                nvs.remove(key)?;
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "espidf"))]
impl Settings {
    /// In-memory store for host builds and tests.
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.store.lock().unwrap().get(key) {
            Some(Value::Str(s)) => s.clone(),
            _ => default.to_owned(),
        }
    }

    pub fn put_string(&self, key: &str, value: &str) {
        self.store
            .lock()
            .unwrap()
            .insert(key.to_owned(), Value::Str(value.to_owned()));
    }

    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.store.lock().unwrap().get(key) {
            Some(Value::Int(v)) => *v,
            _ => default,
        }
    }

    pub fn put_int(&self, key: &str, value: i32) {
        self.store
            .lock()
            .unwrap()
            .insert(key.to_owned(), Value::Int(value));
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.store.lock().unwrap().get(key) {
            Some(Value::Bool(v)) => *v,
            _ => default,
        }
    }

    pub fn put_bool(&self, key: &str, value: bool) {
        self.store
            .lock()
            .unwrap()
            .insert(key.to_owned(), Value::Bool(value));
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.store.lock().unwrap().contains_key(key)
    }

    pub fn clear(&self) {
        self.store.lock().unwrap().clear();
    }
}

// ── Typed view ────────────────────────────────────────────────

/// Materialised settings record with defaults applied.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node_name: heapless::String<MAX_STRING_LEN>,
    pub mqtt_broker: heapless::String<MAX_STRING_LEN>,
    pub mqtt_port: u16,
    pub mqtt_user: heapless::String<MAX_STRING_LEN>,
    pub mqtt_password: heapless::String<MAX_STRING_LEN>,
    pub mqtt_topic: heapless::String<MAX_TOPIC_LEN>,
    pub sleep_hours: i32,
    pub config_done: bool,
}

fn bounded<const N: usize>(value: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for ch in value.chars() {
        if out.push(ch).is_err() {
            warn!("settings: value truncated to {} bytes", N);
            break;
        }
    }
    out
}

impl NodeSettings {
    pub fn load(settings: &Settings) -> Self {
        let port = settings.get_int(KEY_MQTT_PORT, i32::from(DEFAULT_MQTT_PORT));
        Self {
            node_name: bounded(&settings.get_string(KEY_NODE_NAME, DEFAULT_NODE_NAME)),
            mqtt_broker: bounded(&settings.get_string(KEY_MQTT_BROKER, "")),
            mqtt_port: u16::try_from(port).unwrap_or(DEFAULT_MQTT_PORT),
            mqtt_user: bounded(&settings.get_string(KEY_MQTT_USER, "")),
            mqtt_password: bounded(&settings.get_string(KEY_MQTT_PASSWORD, "")),
            mqtt_topic: bounded(&settings.get_string(KEY_MQTT_TOPIC, "")),
            sleep_hours: settings.get_int(KEY_SLEEP_HOURS, DEFAULT_SLEEP_HOURS),
            config_done: settings.get_bool(KEY_CONFIG_DONE, false),
        }
    }

    /// The precondition for the normal cycle is `config_done` plus a
    /// non-empty broker and topic; anything else forces provisioning.
    pub fn needs_provisioning(&self) -> bool {
        !self.config_done || self.mqtt_broker.is_empty() || self.mqtt_topic.is_empty()
    }
}
