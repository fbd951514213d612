//! Build-time configuration and tunable constants.
//!
//! Values mirror the board design: a 400×300 black/white/red panel on the
//! ESP32 SPI bus, a MAX17048 fuel gauge on I²C, and a single config-mode
//! jumper. Firmware identity (version, OTA public key) is injected at
//! build time via environment variables.

// --- Display geometry ---
/// Panel width in pixels.
pub const SCREEN_W: i32 = 400;
/// Panel height in pixels.
pub const SCREEN_H: i32 = 300;
/// Gauge grid columns.
pub const GAUGE_COLS: usize = 3;
/// Gauge grid rows.
pub const GAUGE_ROWS: usize = 2;
/// Maximum plants shown on the dashboard.
pub const MAX_PLANTS: usize = GAUGE_COLS * GAUGE_ROWS;

// --- Thresholds ---
/// Moisture below this value renders red with a "LOW!" label.
pub const MOISTURE_LOW_THRESHOLD: i32 = 35;
/// Battery below this value renders the header icon and percentage red.
pub const BATTERY_LOW_THRESHOLD: i32 = 10;

// --- Defaults persisted on first boot ---
pub const DEFAULT_NODE_NAME: &str = "e-paper-display";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_SLEEP_HOURS: i32 = 1;

// --- Timing budgets ---
/// Wi-Fi association budget (polled in 500 ms steps).
pub const WIFI_CONNECT_TIMEOUT_MS: u32 = 30_000;
/// MQTT connect budget (500 ms back-off between attempts).
pub const MQTT_CONNECT_TIMEOUT_MS: u32 = 10_000;
/// Retained OTA directive wait.
pub const OTA_RETAINED_WAIT_MS: u32 = 5_000;
/// Retained snapshot wait.
pub const DATA_RETAINED_WAIT_MS: u32 = 10_000;
/// Config portal lifetime in seconds.
pub const CONFIG_PORTAL_TIMEOUT_SECS: u32 = 300;
/// Total OTA download+install deadline.
pub const OTA_INSTALL_TIMEOUT_SECS: u64 = 300;

// --- MQTT ---
/// Inbound payloads beyond this are dropped by the client.
pub const MQTT_BUFFER_SIZE: usize = 1024;

// --- Settings ---
pub const SETTINGS_NAMESPACE: &str = "epaper";
/// Names, brokers, users and passwords are bounded to 63 chars.
pub const MAX_STRING_LEN: usize = 64;
/// Topics are bounded to 127 chars.
pub const MAX_TOPIC_LEN: usize = 128;

/// Firmware version string reported in the status record.
///
/// Overridable at build time with `FIRMWARE_VERSION`; defaults to the
/// crate version.
pub fn firmware_version() -> &'static str {
    option_env!("FIRMWARE_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}

/// Compiled-in Ed25519 public key for OTA signature verification.
///
/// `IDENTITYLABS_PUB_KEY` must be 64 hex chars (32 bytes). Returns `None`
/// when the variable is absent or malformed; OTA verification then fails
/// closed, which is the desired behaviour for unkeyed dev builds.
pub fn ota_public_key() -> Option<[u8; 32]> {
    decode_key_hex(option_env!("IDENTITYLABS_PUB_KEY")?)
}

pub(crate) fn decode_key_hex(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        let pair = hex.get(i * 2..i * 2 + 2)?;
        *byte = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(key)
}
