//! End-to-end wake cycle scenarios against the simulation backends.
//!
//! Each test boots the orchestrator with a scripted broker and a
//! recording panel and asserts on the observable outcome: what was
//! drawn, what was published, and how the cycle ended.

#![cfg(not(target_os = "espidf"))]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signer as _, SigningKey};

use plantpanel::cycle::{CycleOutcome, run_cycle};
use plantpanel::display::{Ink, RecordingSurface};
use plantpanel::net::Network;
use plantpanel::ota::{Fetcher, OtaEngine, OtaError, UpdateJob};
use plantpanel::power::Power;
use plantpanel::settings::{self, Settings};
use plantpanel::telemetry;

// ── Test fixtures ─────────────────────────────────────────────

struct CountingFetcher {
    calls: Arc<AtomicUsize>,
    result: Result<(), OtaError>,
}

impl Fetcher for CountingFetcher {
    fn fetch_and_install(&mut self, _job: &UpdateJob) -> Result<(), OtaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
    }
}

struct Fixture {
    settings: Settings,
    power: Power,
    net: Network,
    panel: RecordingSurface,
    engine: OtaEngine,
    signing_key: SigningKey,
    fetch_calls: Arc<AtomicUsize>,
}

impl Fixture {
    /// Unprovisioned node, config pin high, no battery sensor.
    fn fresh() -> Self {
        let settings = Settings::new();
        let net = Network::new(settings.clone());
        let signing_key = SigningKey::from_bytes(&[42u8; 32]);
        Self {
            engine: OtaEngine::with_key(*signing_key.verifying_key().as_bytes()),
            signing_key,
            settings,
            power: Power::new(),
            net,
            panel: RecordingSurface::new(),
            fetch_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fully provisioned node named `n1` subscribed to `garden/plants`.
    fn provisioned() -> Self {
        let fixture = Self::fresh();
        let s = &fixture.settings;
        s.put_string(settings::KEY_NODE_NAME, "n1");
        s.put_string(settings::KEY_MQTT_BROKER, "10.0.0.2");
        s.put_string(settings::KEY_MQTT_TOPIC, "garden/plants");
        s.put_int(settings::KEY_SLEEP_HOURS, 2);
        s.put_bool(settings::KEY_CONFIG_DONE, true);
        fixture
    }

    fn run(&mut self) -> CycleOutcome {
        let fetcher = CountingFetcher {
            calls: self.fetch_calls.clone(),
            result: Ok(()),
        };
        run_cycle(
            &self.settings,
            &mut self.power,
            &mut self.net,
            &mut self.panel,
            &self.engine,
            fetcher,
        )
    }

    fn signed_directive(&self, url: &str, md5: &str) -> String {
        let message = format!("{url}{md5}");
        let signature = self.signing_key.sign(message.as_bytes());
        let sig_b64 = BASE64.encode(signature.to_bytes());
        format!(
            r#"{{"url":"{url}","version":"9.9.9","md5sum":"{md5}","signature":"{sig_b64}"}}"#
        )
    }

    fn rendered_texts(&self) -> Vec<String> {
        self.panel
            .texts()
            .iter()
            .map(|(text, _, _)| (*text).to_owned())
            .collect()
    }
}

const SNAPSHOT: &str = r#"{"updateDate":"2025-10-03 22:30",
    "plants":[{"name":"Basil","moisture":72},{"name":"Mint","moisture":12}]}"#;

// ── Scenario 1: fresh boot, no settings ───────────────────────

#[test]
fn fresh_boot_enters_provisioning() {
    let mut fixture = Fixture::fresh();
    let outcome = fixture.run();

    let (ssid, password, timeout) = fixture.net.sim_portal_started().unwrap().clone();
    assert_eq!(ssid, "e-paper-display");
    let password = password.expect("AP must be password protected");
    assert_eq!(password.len(), 8);
    assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(timeout, 300);

    // The config screen must show the same credentials.
    let texts = fixture.rendered_texts();
    assert!(texts.iter().any(|t| t == "e-paper-display"));
    assert!(texts.iter().any(|t| *t == password));

    assert_eq!(outcome, CycleOutcome::Reboot { delay_ms: 0 });
}

#[test]
fn portal_save_reboots_into_a_configured_node() {
    let mut fixture = Fixture::fresh();
    fixture.net.sim_portal_saves(|s| {
        s.put_string(settings::KEY_MQTT_BROKER, "10.0.0.2");
        s.put_string(settings::KEY_MQTT_TOPIC, "garden/plants");
        s.put_bool(settings::KEY_CONFIG_DONE, true);
    });
    let outcome = fixture.run();
    assert_eq!(outcome, CycleOutcome::Reboot { delay_ms: 1000 });
    assert!(!settings::NodeSettings::load(&fixture.settings).needs_provisioning());
}

#[test]
fn config_pin_forces_provisioning_even_when_configured() {
    let mut fixture = Fixture::provisioned();
    fixture.power.sim_set_config_pin_low(true);
    let outcome = fixture.run();
    assert!(fixture.net.sim_portal_started().is_some());
    assert_eq!(outcome, CycleOutcome::Reboot { delay_ms: 0 });
}

#[test]
fn configured_node_never_provisions_on_normal_boot() {
    let mut fixture = Fixture::provisioned();
    fixture.run();
    assert!(fixture.net.sim_portal_started().is_none());
}

// ── Scenario 2: normal snapshot ───────────────────────────────

#[test]
fn normal_snapshot_renders_and_sleeps() {
    let mut fixture = Fixture::provisioned();
    fixture.power.sim_set_battery(4.05, 87, -0.4);
    fixture.net.sim_set_retained("garden/plants", SNAPSHOT);

    let outcome = fixture.run();
    assert_eq!(outcome, CycleOutcome::Sleep { hours: 2 });

    let texts = fixture.panel.texts();
    assert!(texts.iter().any(|(t, _, _)| *t == "PLANT MOISTURE"));
    assert!(texts.iter().any(|(t, _, ink)| {
        t.contains("Updated: 2025-10-03 22:30") && t.contains("Battery:") && *ink == Ink::Black
    }));
    assert!(texts.iter().any(|(t, _, ink)| *t == "87%" && *ink == Ink::Black));
    assert!(texts.iter().any(|(t, _, ink)| *t == "72%" && *ink == Ink::Black));
    assert!(texts.iter().any(|(t, _, ink)| *t == "12%" && *ink == Ink::Red));
    assert!(texts.iter().any(|(t, _, ink)| *t == "LOW!" && *ink == Ink::Red));
    assert!(fixture.panel.hibernated());
}

#[test]
fn status_is_armed_as_will_and_published_online() {
    let mut fixture = Fixture::provisioned();
    fixture.power.sim_set_battery(4.05, 87, -0.4);
    fixture.net.sim_set_retained("garden/plants", SNAPSHOT);
    fixture.run();

    let (lwt_topic, lwt_payload) = fixture.net.sim_lwt().unwrap().clone();
    assert_eq!(lwt_topic, "displays/n1/lwt");
    let will: serde_json::Value = serde_json::from_str(&lwt_payload).unwrap();
    assert_eq!(will["battery_percentage"], 87);
    assert_eq!(will["battery_sensor_present"], true);
    assert_eq!(will["sleep_time"], 2);
    assert_eq!(will["rssi"], -58);

    // The very same record goes out retained as the online heartbeat.
    let published = fixture.net.sim_published();
    let online = published
        .iter()
        .find(|(topic, _, _)| topic == "displays/n1/lwt")
        .expect("online status must be published");
    assert_eq!(online.1, lwt_payload);
    assert!(online.2, "online status must be retained");
}

#[test]
fn two_cycles_with_same_inputs_render_identically() {
    let mut first = Fixture::provisioned();
    first.power.sim_set_battery(4.05, 87, -0.4);
    first.net.sim_set_retained("garden/plants", SNAPSHOT);
    first.run();

    let mut second = Fixture::provisioned();
    second.power.sim_set_battery(4.05, 87, -0.4);
    second.net.sim_set_retained("garden/plants", SNAPSHOT);
    second.run();

    assert_eq!(first.panel.ops, second.panel.ops);
}

// ── Scenario 3: valid OTA ─────────────────────────────────────

#[test]
fn valid_ota_installs_and_reboots_without_rendering() {
    let mut fixture = Fixture::provisioned();
    let directive = fixture.signed_directive("https://x/y.bin", "abc123");
    fixture.net.sim_set_retained("displays/n1/rx", &directive);
    fixture.net.sim_set_retained("garden/plants", SNAPSHOT);

    let outcome = fixture.run();
    assert_eq!(outcome, CycleOutcome::Reboot { delay_ms: 1000 });
    assert_eq!(fixture.fetch_calls.load(Ordering::SeqCst), 1);

    // The one-shot directive is consumed.
    assert_eq!(fixture.net.sim_retained("displays/n1/rx"), None);

    let texts = fixture.rendered_texts();
    assert!(texts.iter().any(|t| t == "Updating firmware..."));
    assert!(
        !texts.iter().any(|t| t == "PLANT MOISTURE"),
        "no dashboard render on an update cycle"
    );
}

// ── Scenario 4: OTA with a bad signature ──────────────────────

#[test]
fn bad_ota_signature_clears_directive_and_renders_normally() {
    let mut fixture = Fixture::provisioned();
    let directive = fixture
        .signed_directive("https://x/y.bin", "abc123")
        .replace("https://x/y.bin", "https://evil/y.bin");
    fixture.net.sim_set_retained("displays/n1/rx", &directive);
    fixture.net.sim_set_retained("garden/plants", SNAPSHOT);

    let outcome = fixture.run();
    assert_eq!(outcome, CycleOutcome::Sleep { hours: 2 });
    assert_eq!(
        fixture.fetch_calls.load(Ordering::SeqCst),
        0,
        "no download may happen on a bad signature"
    );
    assert_eq!(fixture.net.sim_retained("displays/n1/rx"), None);
    assert!(fixture.rendered_texts().iter().any(|t| t == "PLANT MOISTURE"));
}

// ── Scenario 5: broker unreachable ────────────────────────────

#[test]
fn broker_failure_reboots_without_touching_the_panel() {
    let mut fixture = Fixture::provisioned();
    fixture.net.sim_fail_mqtt();
    let outcome = fixture.run();
    assert_eq!(outcome, CycleOutcome::Reboot { delay_ms: 0 });
    assert!(fixture.panel.ops.is_empty());
}

#[test]
fn wifi_failure_reboots_without_touching_the_panel() {
    let mut fixture = Fixture::provisioned();
    fixture.net.sim_fail_wifi();
    let outcome = fixture.run();
    assert_eq!(outcome, CycleOutcome::Reboot { delay_ms: 0 });
    assert!(fixture.panel.ops.is_empty());
}

// ── Scenario 6: seven plants ──────────────────────────────────

#[test]
fn seven_plants_render_exactly_six_gauges() {
    let mut fixture = Fixture::provisioned();
    let plants: Vec<String> = (0..7)
        .map(|i| format!(r#"{{"name":"p{i}","moisture":50}}"#))
        .collect();
    let payload = format!(r#"{{"updateDate":"x","plants":[{}]}}"#, plants.join(","));
    fixture.net.sim_set_retained("garden/plants", &payload);

    let outcome = fixture.run();
    assert_eq!(outcome, CycleOutcome::Sleep { hours: 2 });

    let gauges = fixture
        .panel
        .texts()
        .iter()
        .filter(|(t, size, _)| *size == 2 && t.ends_with('%'))
        .count();
    assert_eq!(gauges, 6);
    assert!(!fixture.rendered_texts().iter().any(|t| t == "p6"));
}

// ── Degraded ingest paths ─────────────────────────────────────

#[test]
fn missing_snapshot_renders_waiting_placeholder() {
    let mut fixture = Fixture::provisioned();
    let outcome = fixture.run();
    assert_eq!(outcome, CycleOutcome::Sleep { hours: 2 });
    let texts = fixture.rendered_texts();
    assert!(texts.iter().any(|t| t.contains("Waiting...")));
    assert!(texts.iter().any(|t| t == "No Data"));
}

#[test]
fn malformed_snapshot_renders_error_placeholder() {
    let mut fixture = Fixture::provisioned();
    fixture.net.sim_set_retained("garden/plants", "{this is not json");
    fixture.run();
    let texts = fixture.rendered_texts();
    assert!(texts.iter().any(|t| t.contains("ERROR")));
    assert!(texts.iter().any(|t| t == "JSON Error"));
}

#[test]
fn placeholder_battery_reading_shows_fifty_percent() {
    let mut fixture = Fixture::provisioned();
    fixture.net.sim_set_retained("garden/plants", SNAPSHOT);
    fixture.run();
    assert!(!fixture.power.battery_sensor_present());
    assert!(fixture
        .panel
        .texts()
        .iter()
        .any(|(t, _, ink)| *t == "50%" && *ink == Ink::Black));
}

#[test]
fn subscriptions_check_ota_before_data() {
    let mut fixture = Fixture::provisioned();
    fixture.net.sim_set_retained("garden/plants", SNAPSHOT);
    fixture.run();
    assert_eq!(
        fixture.net.sim_subscriptions(),
        ["displays/n1/rx".to_owned(), "garden/plants".to_owned()]
    );
}

#[test]
fn client_id_embeds_node_name_and_mac() {
    let id = telemetry::client_id("n1", &telemetry::read_mac());
    assert!(id.as_str().starts_with("n1-"));
    assert_eq!(id.len(), "n1-".len() + 12);
}
