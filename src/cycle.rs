//! Wake-cycle orchestrator.
//!
//! One boot runs this sequence to completion and then the node sleeps:
//!
//! ```text
//! boot → settings → config pin → (provision | normal)
//! normal: wifi → status/LWT → mqtt → OTA check → render → publish → sleep
//! ```
//!
//! Every failed transition resolves to a reboot: deep sleep is the
//! normal recovery path, so the next cycle retries from clean state.
//! The sequencer itself only *returns* the outcome; `main.rs` performs
//! the actual restart or deep sleep, which keeps this module fully
//! host-testable.

use log::{info, warn};

use crate::config::{
    CONFIG_PORTAL_TIMEOUT_SECS, DATA_RETAINED_WAIT_MS, OTA_RETAINED_WAIT_MS,
};
use crate::display::{Surface, render_dashboard, screens};
use crate::net::Gateway;
use crate::ota::{Fetcher, OtaEngine};
use crate::power::Power;
use crate::settings::{NodeSettings, Settings};
use crate::snapshot::PlantSnapshot;
use crate::telemetry::{self, StatusRecord};

/// How a wake cycle ends. `main.rs` maps this onto `esp_restart` /
/// `Power::enter_deep_sleep`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Reboot { delay_ms: u32 },
    Sleep { hours: i32 },
}

/// Run one full wake cycle.
pub fn run_cycle<G: Gateway, S: Surface, F: Fetcher>(
    settings: &Settings,
    power: &mut Power,
    net: &mut G,
    panel: &mut S,
    engine: &OtaEngine,
    fetcher: F,
) -> CycleOutcome {
    // ── S0: boot ──────────────────────────────────────────────
    let config_disabled = power.is_deep_sleep_disabled();
    info!(
        "config pin: {}",
        if config_disabled {
            "LOW (config mode forced)"
        } else {
            "HIGH (normal mode)"
        }
    );
    power.init_battery_sensor();

    let node = NodeSettings::load(settings);
    info!("node: {}", node.node_name);

    // ── S1: decide ────────────────────────────────────────────
    if config_disabled || node.needs_provisioning() {
        if config_disabled {
            info!("deep sleep disabled - entering config mode");
        } else {
            info!("no configuration found - entering config mode");
        }
        return provision(net, panel, &node);
    }

    // ── S3: network ───────────────────────────────────────────
    if !net.connect_wifi() {
        warn!("WiFi connection failed, rebooting");
        return CycleOutcome::Reboot { delay_ms: 0 };
    }

    let status = StatusRecord::collect(power, net.rssi(), node.sleep_hours);
    let status_json = status.to_json();
    let lwt_topic = telemetry::lwt_topic(&node.node_name);
    net.set_mqtt_last_will(&lwt_topic, &status_json);

    let client_id = telemetry::client_id(&node.node_name, &telemetry::read_mac());
    if !net.connect_mqtt(&client_id) {
        warn!("MQTT connection failed, rebooting");
        return CycleOutcome::Reboot { delay_ms: 0 };
    }

    // ── S4: OTA check ─────────────────────────────────────────
    let ota_topic = telemetry::ota_topic(&node.node_name);
    info!("checking for OTA directive on {}", ota_topic);
    if net.subscribe(&ota_topic) {
        let directive = net.await_retained(OTA_RETAINED_WAIT_MS);
        if !directive.is_empty() {
            info!("OTA directive received");
            // The directive is one-shot: clear the retained copy before
            // doing anything that could fail, or a broken image would be
            // retried on every wake.
            if !net.publish(&ota_topic, "", true) {
                warn!("failed to clear OTA directive");
            }
            screens::render_upgrade_screen(panel);
            if engine.process_update(&directive, net.wifi_connected(), fetcher) {
                info!("OTA complete, rebooting into new firmware");
                return CycleOutcome::Reboot { delay_ms: 1000 };
            }
            warn!("OTA failed, continuing normal cycle");
        } else {
            info!("no OTA directive pending");
        }
    }

    // ── S5: render ────────────────────────────────────────────
    let battery_pct = power.battery_percentage();
    if node.mqtt_topic.is_empty() {
        warn!("no data topic configured");
        render_dashboard(panel, &PlantSnapshot::waiting(), battery_pct);
    } else {
        info!("subscribing to {}", node.mqtt_topic);
        net.subscribe(&node.mqtt_topic);
        let payload = net.await_retained(DATA_RETAINED_WAIT_MS);
        let snapshot = if payload.is_empty() {
            info!("no retained snapshot, rendering placeholder");
            PlantSnapshot::waiting()
        } else {
            PlantSnapshot::parse(&payload).unwrap_or_else(|err| {
                warn!("snapshot parse error: {err}");
                PlantSnapshot::json_error()
            })
        };
        render_dashboard(panel, &snapshot, battery_pct);
    }

    // ── S6: finish ────────────────────────────────────────────
    net.publish(&lwt_topic, &status_json, true);
    panel.hibernate();
    net.disconnect_mqtt();
    net.disconnect_wifi();
    info!("cycle complete, sleeping for {} hour(s)", node.sleep_hours);
    CycleOutcome::Sleep {
        hours: node.sleep_hours,
    }
}

// ── S2: provisioning ──────────────────────────────────────────

fn provision<G: Gateway, S: Surface>(
    net: &mut G,
    panel: &mut S,
    node: &NodeSettings,
) -> CycleOutcome {
    let password = generate_ap_password();
    info!("AP SSID: {}", node.node_name);
    info!("AP password: {}", password);

    screens::render_config_screen(panel, &node.node_name, &password);

    let saved = net.start_config_portal(
        &node.node_name,
        Some(&password),
        CONFIG_PORTAL_TIMEOUT_SECS,
    );
    if saved {
        info!("configuration saved, rebooting");
        CycleOutcome::Reboot { delay_ms: 1000 }
    } else {
        info!("config portal timed out, rebooting");
        CycleOutcome::Reboot { delay_ms: 0 }
    }
}

const AP_PASSWORD_LEN: usize = 8;
const AP_PASSWORD_CHARSET: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Derive an 8-char alphanumeric AP password from the hardware RNG.
pub fn generate_ap_password() -> heapless::String<16> {
    let mut password = heapless::String::new();
    for _ in 0..AP_PASSWORD_LEN {
        let index = random_u32() as usize % AP_PASSWORD_CHARSET.len();
        let _ = password.push(AP_PASSWORD_CHARSET[index] as char);
    }
    password
}

#[cfg(target_os = "espidf")]
fn random_u32() -> u32 {
    // Backed by the RF entropy source.
    unsafe { esp_idf_svc::sys::esp_random() }
}

#[cfg(not(target_os = "espidf"))]
fn random_u32() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static STATE: AtomicU32 = AtomicU32::new(0x2F6E_2B71);
    // xorshift; entropy quality is irrelevant on the host.
    let mut x = STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    STATE.store(x, Ordering::Relaxed);
    x
}
