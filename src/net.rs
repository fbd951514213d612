//! Network gateway: Wi-Fi station, captive configuration portal, and the
//! MQTT session with Last-Will status reporting.
//!
//! The node is only ever online for a few seconds per wake cycle, so the
//! gateway is built around retained messages: subscribe, wait briefly for
//! the broker to replay the retained payload, disconnect. Inbound
//! payloads are copied into a caller-owned [`MessageSlot`] shared with
//! the MQTT event thread; the slot travels through the callback
//! registration, so there is no process-wide instance.
//!
//! The host backend simulates the broker with scripted retained payloads
//! and records every publish, which is what the wake-cycle integration
//! tests drive.

/// Latest inbound payload, level-triggered per wake cycle: only the most
/// recent message is kept.
#[derive(Debug, Default)]
pub struct MessageSlot {
    pub payload: String,
    pub received: bool,
    pub connected: bool,
}

/// Everything the orchestrator needs from the network.
pub trait Gateway {
    /// Bring up a soft-AP with a captive configuration UI. Blocks until
    /// the user saves or `timeout_secs` elapses; accepted values are
    /// persisted through [`Settings`](crate::settings::Settings). Returns
    /// whether a save happened.
    fn start_config_portal(
        &mut self,
        ap_name: &str,
        ap_password: Option<&str>,
        timeout_secs: u32,
    ) -> bool;

    /// Associate using the credentials stored by the portal. Polls up to
    /// 30 s in 500 ms steps.
    fn connect_wifi(&mut self) -> bool;

    /// Arm the retained QoS-0 will used on the next [`connect_mqtt`](Gateway::connect_mqtt).
    fn set_mqtt_last_will(&mut self, topic: &str, payload: &str);

    /// Connect to the configured broker within a 10 s budget, 500 ms
    /// back-off between attempts. Fails fast when no broker is set.
    fn connect_mqtt(&mut self, client_id: &str) -> bool;

    fn subscribe(&mut self, topic: &str) -> bool;

    fn publish(&mut self, topic: &str, payload: &str, retained: bool) -> bool;

    /// Drive the MQTT session in 10 ms slices until a message lands or
    /// the timeout elapses; returns the captured payload (possibly
    /// empty). Retained messages arrive right after subscribe, so this is
    /// the node's entire ingest path.
    fn await_retained(&mut self, timeout_ms: u32) -> String;

    fn disconnect_mqtt(&mut self);
    fn disconnect_wifi(&mut self);

    fn wifi_connected(&self) -> bool;
    fn rssi(&self) -> i32;
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub use esp_backend::Network;

#[cfg(target_os = "espidf")]
mod esp_backend {
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::{Context, Result};
    use embedded_svc::http::Method;
    use embedded_svc::io::{Read as _, Write as _};
    use embedded_svc::wifi::{
        AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration,
    };
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::modem::Modem;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::http::server::{Configuration as HttpConfiguration, EspHttpServer};
    use esp_idf_svc::mqtt::client::{
        EspMqttClient, EventPayload, LwtConfiguration, MqttClientConfiguration, QoS,
    };
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
    use log::{info, warn};
    use serde::{Deserialize, Serialize};

    use super::{Gateway, MessageSlot};
    use crate::config::{
        CONFIG_PORTAL_TIMEOUT_SECS, MQTT_BUFFER_SIZE, MQTT_CONNECT_TIMEOUT_MS,
        WIFI_CONNECT_TIMEOUT_MS,
    };
    use crate::settings::{
        self, NodeSettings, Settings,
    };

    const PORTAL_HTML: &str = include_str!("portal.html");

    /// Captive-portal probe paths that must all serve the form.
    const CAPTIVE_PATHS: [&str; 7] = [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ];

    #[derive(Debug, Serialize)]
    struct ConfigView<'a> {
        #[serde(rename = "nodeName")]
        node_name: &'a str,
        #[serde(rename = "mqttBroker")]
        mqtt_broker: &'a str,
        #[serde(rename = "mqttPort")]
        mqtt_port: u16,
        #[serde(rename = "mqttUser")]
        mqtt_user: &'a str,
        #[serde(rename = "mqttTopic")]
        mqtt_topic: &'a str,
        #[serde(rename = "sleepHours")]
        sleep_hours: i32,
    }

    #[derive(Debug, Clone, Deserialize)]
    struct ConfigUpdate {
        #[serde(rename = "wifiSsid")]
        wifi_ssid: String,
        #[serde(rename = "wifiPass", default)]
        wifi_pass: String,
        #[serde(rename = "nodeName")]
        node_name: String,
        #[serde(rename = "mqttBroker")]
        mqtt_broker: String,
        #[serde(rename = "mqttPort")]
        mqtt_port: u16,
        #[serde(rename = "mqttUser", default)]
        mqtt_user: String,
        #[serde(rename = "mqttPass", default)]
        mqtt_pass: String,
        #[serde(rename = "mqttTopic")]
        mqtt_topic: String,
        #[serde(rename = "sleepHours")]
        sleep_hours: i32,
    }

    pub struct Network {
        wifi: BlockingWifi<EspWifi<'static>>,
        mqtt: Option<EspMqttClient<'static>>,
        slot: Arc<Mutex<MessageSlot>>,
        lwt: Option<(String, String)>,
        settings: Settings,
        node: NodeSettings,
    }

    impl Network {
        pub fn new(
            modem: Modem,
            sysloop: EspSystemEventLoop,
            nvs: EspDefaultNvsPartition,
            settings: Settings,
        ) -> Result<Self> {
            let esp_wifi = EspWifi::new(modem, sysloop.clone(), Some(nvs))
                .context("WiFi driver init failed")?;
            let wifi =
                BlockingWifi::wrap(esp_wifi, sysloop).context("WiFi event wrapper failed")?;
            let node = NodeSettings::load(&settings);
            Ok(Self {
                wifi,
                mqtt: None,
                slot: Arc::new(Mutex::new(MessageSlot::default())),
                lwt: None,
                settings,
                node,
            })
        }

        fn apply_update(&mut self, update: &ConfigUpdate) {
            let s = &self.settings;
            s.put_string(settings::KEY_NODE_NAME, update.node_name.trim());
            s.put_string(settings::KEY_MQTT_BROKER, update.mqtt_broker.trim());
            s.put_int(settings::KEY_MQTT_PORT, i32::from(update.mqtt_port));
            s.put_string(settings::KEY_MQTT_USER, update.mqtt_user.trim());
            s.put_string(settings::KEY_MQTT_PASSWORD, &update.mqtt_pass);
            s.put_string(settings::KEY_MQTT_TOPIC, update.mqtt_topic.trim());
            s.put_int(settings::KEY_SLEEP_HOURS, update.sleep_hours.clamp(1, 24));
            s.put_bool(settings::KEY_CONFIG_DONE, true);

            info!("portal: configuration saved");
            info!("portal:   node name:   {}", update.node_name.trim());
            info!("portal:   mqtt broker: {}", update.mqtt_broker.trim());
            info!("portal:   mqtt topic:  {}", update.mqtt_topic.trim());
            info!("portal:   sleep hours: {}", update.sleep_hours.clamp(1, 24));

            // Station credentials go to the WiFi subsystem's own storage.
            let client = ClientConfiguration {
                ssid: update.wifi_ssid.as_str().try_into().unwrap_or_default(),
                password: update.wifi_pass.as_str().try_into().unwrap_or_default(),
                auth_method: if update.wifi_pass.is_empty() {
                    AuthMethod::None
                } else {
                    AuthMethod::WPA2Personal
                },
                ..Default::default()
            };
            if let Err(err) = self.wifi.set_configuration(&Configuration::Client(client)) {
                warn!("portal: storing WiFi credentials failed: {err}");
            }
        }
    }

    fn validate_update(update: &ConfigUpdate) -> Result<(), &'static str> {
        if update.wifi_ssid.trim().is_empty() {
            return Err("wifiSsid cannot be empty");
        }
        if update.mqtt_broker.trim().is_empty() {
            return Err("mqttBroker cannot be empty");
        }
        if update.mqtt_port == 0 {
            return Err("mqttPort must be between 1 and 65535");
        }
        if update.mqtt_topic.trim().is_empty() {
            return Err("mqttTopic cannot be empty");
        }
        if !(1..=24).contains(&update.sleep_hours) {
            return Err("sleepHours must be between 1 and 24");
        }
        Ok(())
    }

    impl Gateway for Network {
        fn start_config_portal(
            &mut self,
            ap_name: &str,
            ap_password: Option<&str>,
            timeout_secs: u32,
        ) -> bool {
            let password = ap_password.unwrap_or("");
            let ap = AccessPointConfiguration {
                ssid: ap_name.try_into().unwrap_or_default(),
                password: password.try_into().unwrap_or_default(),
                auth_method: if password.is_empty() {
                    AuthMethod::None
                } else {
                    AuthMethod::WPA2Personal
                },
                channel: 1,
                ..Default::default()
            };
            if let Err(err) = self.wifi.set_configuration(&Configuration::AccessPoint(ap)) {
                warn!("portal: AP configuration failed: {err}");
                return false;
            }
            if let Err(err) = self.wifi.start().and_then(|()| self.wifi.wait_netif_up()) {
                warn!("portal: AP start failed: {err}");
                return false;
            }
            info!("portal: AP '{}' up, serving configuration UI", ap_name);

            let pending: Arc<Mutex<Option<ConfigUpdate>>> = Arc::new(Mutex::new(None));
            let view = ConfigView {
                node_name: self.node.node_name.as_str(),
                mqtt_broker: self.node.mqtt_broker.as_str(),
                mqtt_port: self.node.mqtt_port,
                mqtt_user: self.node.mqtt_user.as_str(),
                mqtt_topic: self.node.mqtt_topic.as_str(),
                sleep_hours: self.node.sleep_hours,
            };
            let view_json = serde_json::to_string(&view).unwrap_or_else(|_| "{}".to_owned());

            let server = match serve_portal(&view_json, pending.clone()) {
                Ok(server) => server,
                Err(err) => {
                    warn!("portal: HTTP server failed: {err:#}");
                    return false;
                }
            };

            let timeout_secs = if timeout_secs == 0 {
                CONFIG_PORTAL_TIMEOUT_SECS
            } else {
                timeout_secs
            };
            let deadline = Instant::now() + Duration::from_secs(u64::from(timeout_secs));
            let saved = loop {
                if let Some(update) = pending.lock().unwrap().take() {
                    break Some(update);
                }
                if Instant::now() >= deadline {
                    break None;
                }
                FreeRtos::delay_ms(500);
            };
            drop(server);

            match saved {
                Some(update) => {
                    self.apply_update(&update);
                    true
                }
                None => {
                    info!("portal: timed out with no configuration");
                    false
                }
            }
        }

        fn connect_wifi(&mut self) -> bool {
            let stored = match self.wifi.get_configuration() {
                Ok(Configuration::Client(client)) if !client.ssid.is_empty() => client,
                Ok(_) | Err(_) => {
                    warn!("wifi: no stored credentials, cannot associate");
                    return false;
                }
            };
            info!("wifi: connecting to '{}'", stored.ssid);

            if let Err(err) = self
                .wifi
                .set_configuration(&Configuration::Client(stored.clone()))
                .and_then(|()| self.wifi.start())
            {
                warn!("wifi: start failed: {err}");
                return false;
            }
            if let Err(err) = self.wifi.wifi_mut().connect() {
                warn!("wifi: connect failed: {err}");
                return false;
            }

            let mut waited = 0;
            while waited < WIFI_CONNECT_TIMEOUT_MS {
                if self.wifi.is_connected().unwrap_or(false) {
                    if let Ok(ip_info) = self.wifi.wifi().sta_netif().get_ip_info() {
                        if !ip_info.ip.is_unspecified() {
                            info!("wifi: connected to '{}', ip {}", stored.ssid, ip_info.ip);
                            return true;
                        }
                    }
                }
                FreeRtos::delay_ms(500);
                waited += 500;
            }
            warn!("wifi: association timed out after {} ms", waited);
            false
        }

        fn set_mqtt_last_will(&mut self, topic: &str, payload: &str) {
            self.lwt = Some((topic.to_owned(), payload.to_owned()));
        }

        fn connect_mqtt(&mut self, client_id: &str) -> bool {
            if self.node.mqtt_broker.is_empty() {
                warn!("mqtt: no broker configured");
                return false;
            }
            let url = format!("mqtt://{}:{}", self.node.mqtt_broker, self.node.mqtt_port);
            info!("mqtt: connecting to {} as '{}'", url, client_id);

            let conf = MqttClientConfiguration {
                client_id: Some(client_id),
                username: (!self.node.mqtt_user.is_empty()).then(|| self.node.mqtt_user.as_str()),
                password: (!self.node.mqtt_password.is_empty())
                    .then(|| self.node.mqtt_password.as_str()),
                lwt: self.lwt.as_ref().map(|(topic, payload)| LwtConfiguration {
                    topic,
                    payload: payload.as_bytes(),
                    qos: QoS::AtMostOnce,
                    retain: true,
                }),
                buffer_size: MQTT_BUFFER_SIZE,
                ..Default::default()
            };

            let started = Instant::now();
            let budget = Duration::from_millis(u64::from(MQTT_CONNECT_TIMEOUT_MS));
            while started.elapsed() < budget {
                match EspMqttClient::new(&url, &conf) {
                    Ok((client, mut connection)) => {
                        let slot = self.slot.clone();
                        let spawned = thread::Builder::new()
                            .name("mqtt-poll".into())
                            .stack_size(8192)
                            .spawn(move || {
                                while let Ok(event) = connection.next() {
                                    match event.payload() {
                                        EventPayload::Connected(_) => {
                                            slot.lock().unwrap().connected = true;
                                        }
                                        EventPayload::Received { data, .. } => {
                                            let mut slot = slot.lock().unwrap();
                                            slot.payload =
                                                String::from_utf8_lossy(data).into_owned();
                                            slot.received = true;
                                        }
                                        EventPayload::Disconnected => {
                                            slot.lock().unwrap().connected = false;
                                        }
                                        _ => {}
                                    }
                                }
                            });
                        if spawned.is_err() {
                            warn!("mqtt: event thread spawn failed");
                            return false;
                        }

                        // The client connects asynchronously; wait out the
                        // remaining budget for the Connected event.
                        while started.elapsed() < budget {
                            if self.slot.lock().unwrap().connected {
                                info!("mqtt: connected");
                                self.mqtt = Some(client);
                                return true;
                            }
                            FreeRtos::delay_ms(100);
                        }
                        warn!("mqtt: broker did not accept within budget");
                        return false;
                    }
                    Err(err) => {
                        warn!("mqtt: client create failed: {err}");
                        FreeRtos::delay_ms(500);
                    }
                }
            }
            warn!("mqtt: connection failed after {} ms", started.elapsed().as_millis());
            false
        }

        fn subscribe(&mut self, topic: &str) -> bool {
            let Some(client) = self.mqtt.as_mut() else {
                return false;
            };
            {
                let mut slot = self.slot.lock().unwrap();
                slot.payload.clear();
                slot.received = false;
            }
            info!("mqtt: subscribing to {}", topic);
            client.subscribe(topic, QoS::AtMostOnce).is_ok()
        }

        fn publish(&mut self, topic: &str, payload: &str, retained: bool) -> bool {
            let Some(client) = self.mqtt.as_mut() else {
                return false;
            };
            client
                .publish(topic, QoS::AtMostOnce, retained, payload.as_bytes())
                .is_ok()
        }

        fn await_retained(&mut self, timeout_ms: u32) -> String {
            let mut waited = 0;
            while waited < timeout_ms {
                if self.slot.lock().unwrap().received {
                    break;
                }
                FreeRtos::delay_ms(10);
                waited += 10;
            }
            let mut slot = self.slot.lock().unwrap();
            slot.received = false;
            std::mem::take(&mut slot.payload)
        }

        fn disconnect_mqtt(&mut self) {
            if self.mqtt.take().is_some() {
                info!("mqtt: disconnected");
            }
        }

        fn disconnect_wifi(&mut self) {
            if self.wifi.is_connected().unwrap_or(false) {
                let _ = self.wifi.disconnect();
                info!("wifi: disconnected");
            }
        }

        fn wifi_connected(&self) -> bool {
            self.wifi.is_connected().unwrap_or(false)
        }

        fn rssi(&self) -> i32 {
            let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
            let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
            if rc == esp_idf_svc::sys::ESP_OK {
                i32::from(ap_info.rssi)
            } else {
                0
            }
        }
    }

    fn serve_portal(
        view_json: &str,
        pending: Arc<Mutex<Option<ConfigUpdate>>>,
    ) -> Result<EspHttpServer<'static>> {
        let conf = HttpConfiguration {
            stack_size: 16 * 1024,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        for path in CAPTIVE_PATHS {
            server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
                req.into_response(
                    200,
                    Some("OK"),
                    &[("Content-Type", "text/html; charset=utf-8")],
                )?
                .write_all(PORTAL_HTML.as_bytes())?;
                Ok(())
            })?;
        }

        {
            let view_json = view_json.to_owned();
            server.fn_handler::<anyhow::Error, _>("/api/config", Method::Get, move |req| {
                req.into_response(
                    200,
                    Some("OK"),
                    &[("Content-Type", "application/json; charset=utf-8")],
                )?
                .write_all(view_json.as_bytes())?;
                Ok(())
            })?;
        }

        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Post, move |mut req| {
            let mut body = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                let read = req.read(&mut chunk)?;
                if read == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..read]);
                if body.len() > 4096 {
                    anyhow::bail!("request body too large");
                }
            }

            let update: ConfigUpdate = match serde_json::from_slice(&body) {
                Ok(update) => update,
                Err(err) => {
                    let message = format!(r#"{{"error":"invalid payload: {err}"}}"#);
                    req.into_response(400, None, &[("Content-Type", "application/json")])?
                        .write_all(message.as_bytes())?;
                    return Ok(());
                }
            };
            if let Err(message) = validate_update(&update) {
                let body = format!(r#"{{"error":"{message}"}}"#);
                req.into_response(400, None, &[("Content-Type", "application/json")])?
                    .write_all(body.as_bytes())?;
                return Ok(());
            }

            *pending.lock().unwrap() = Some(update);
            req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?
                .write_all(br#"{"saved":true}"#)?;
            Ok(())
        })?;

        Ok(server)
    }
}

// ───────────────────────────────────────────────────────────────
// Host simulation backend
// ───────────────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
pub use sim_backend::Network;

#[cfg(not(target_os = "espidf"))]
mod sim_backend {
    use std::collections::HashMap;

    use log::{info, warn};

    use super::Gateway;
    use crate::settings::Settings;

    /// Scripted broker + radio for host tests.
    pub struct Network {
        settings: Settings,
        wifi_up: bool,
        mqtt_up: bool,
        fail_wifi: bool,
        fail_mqtt: bool,
        portal_saves: Option<Box<dyn FnOnce(&Settings) + Send>>,
        lwt: Option<(String, String)>,
        retained: HashMap<String, String>,
        subscribed: Option<String>,
        subscriptions: Vec<String>,
        published: Vec<(String, String, bool)>,
        portal_started: Option<(String, Option<String>, u32)>,
    }

    impl Network {
        pub fn new(settings: Settings) -> Self {
            Self {
                settings,
                wifi_up: false,
                mqtt_up: false,
                fail_wifi: false,
                fail_mqtt: false,
                portal_saves: None,
                lwt: None,
                retained: HashMap::new(),
                subscribed: None,
                subscriptions: Vec::new(),
                published: Vec::new(),
                portal_started: None,
            }
        }

        // ── Test hooks ────────────────────────────────────────

        /// Script the broker's retained payload for a topic.
        pub fn sim_set_retained(&mut self, topic: &str, payload: &str) {
            self.retained.insert(topic.to_owned(), payload.to_owned());
        }

        pub fn sim_retained(&self, topic: &str) -> Option<&str> {
            self.retained.get(topic).map(String::as_str)
        }

        pub fn sim_fail_wifi(&mut self) {
            self.fail_wifi = true;
        }

        pub fn sim_fail_mqtt(&mut self) {
            self.fail_mqtt = true;
        }

        /// Make the portal "save": the closure plays the user filling the
        /// form, and the portal reports success.
        pub fn sim_portal_saves(&mut self, apply: impl FnOnce(&Settings) + Send + 'static) {
            self.portal_saves = Some(Box::new(apply));
        }

        pub fn sim_published(&self) -> &[(String, String, bool)] {
            &self.published
        }

        pub fn sim_subscriptions(&self) -> &[String] {
            &self.subscriptions
        }

        pub fn sim_lwt(&self) -> Option<&(String, String)> {
            self.lwt.as_ref()
        }

        pub fn sim_portal_started(&self) -> Option<&(String, Option<String>, u32)> {
            self.portal_started.as_ref()
        }
    }

    impl Gateway for Network {
        fn start_config_portal(
            &mut self,
            ap_name: &str,
            ap_password: Option<&str>,
            timeout_secs: u32,
        ) -> bool {
            self.portal_started = Some((
                ap_name.to_owned(),
                ap_password.map(str::to_owned),
                timeout_secs,
            ));
            match self.portal_saves.take() {
                Some(apply) => {
                    apply(&self.settings);
                    info!("portal(sim): configuration saved");
                    true
                }
                None => {
                    info!("portal(sim): timed out");
                    false
                }
            }
        }

        fn connect_wifi(&mut self) -> bool {
            if self.fail_wifi {
                warn!("wifi(sim): association failed");
                return false;
            }
            self.wifi_up = true;
            info!("wifi(sim): connected");
            true
        }

        fn set_mqtt_last_will(&mut self, topic: &str, payload: &str) {
            self.lwt = Some((topic.to_owned(), payload.to_owned()));
        }

        fn connect_mqtt(&mut self, client_id: &str) -> bool {
            if !self.wifi_up || self.fail_mqtt {
                warn!("mqtt(sim): connect failed for '{}'", client_id);
                return false;
            }
            self.mqtt_up = true;
            true
        }

        fn subscribe(&mut self, topic: &str) -> bool {
            if !self.mqtt_up {
                return false;
            }
            self.subscribed = Some(topic.to_owned());
            self.subscriptions.push(topic.to_owned());
            true
        }

        fn publish(&mut self, topic: &str, payload: &str, retained: bool) -> bool {
            if !self.mqtt_up {
                return false;
            }
            self.published
                .push((topic.to_owned(), payload.to_owned(), retained));
            if retained {
                // An empty retained publish deletes the broker's copy.
                if payload.is_empty() {
                    self.retained.remove(topic);
                } else {
                    self.retained.insert(topic.to_owned(), payload.to_owned());
                }
            }
            true
        }

        fn await_retained(&mut self, _timeout_ms: u32) -> String {
            self.subscribed
                .as_ref()
                .and_then(|topic| self.retained.get(topic))
                .cloned()
                .unwrap_or_default()
        }

        fn disconnect_mqtt(&mut self) {
            self.mqtt_up = false;
        }

        fn disconnect_wifi(&mut self) {
            self.wifi_up = false;
        }

        fn wifi_connected(&self) -> bool {
            self.wifi_up
        }

        fn rssi(&self) -> i32 {
            if self.wifi_up { -58 } else { 0 }
        }
    }
}
