//! Power controller: battery telemetry, config-pin sensing, deep sleep.
//!
//! The fuel gauge is a MAX17048 on the I²C bus (address 0x36). A missing
//! or implausible gauge downgrades to fixed placeholder readings so the
//! dashboard still renders. `enter_deep_sleep` is responsible for the
//! low-leakage teardown: every driven pin goes high-Z with pulls disabled,
//! except the config pin whose pull-up must survive so user intent is
//! readable on the next boot.

use log::{info, warn};

#[cfg(target_os = "espidf")]
use crate::pins;

/// MAX17048 I²C address.
const FUEL_GAUGE_ADDR: u8 = 0x36;
/// Cell voltage, 78.125 µV per LSB.
const REG_VCELL: u8 = 0x02;
/// State of charge, 1/256 % per LSB.
const REG_SOC: u8 = 0x04;
/// Hibernate thresholds; 0x0000 disables hibernation, 0xFFFF forces it.
const REG_HIBRT: u8 = 0x0A;
/// Charge/discharge rate, 0.208 %/h per LSB (signed).
const REG_CRATE: u8 = 0x16;

/// Placeholder readings reported when the gauge is absent.
const PLACEHOLDER_VOLTAGE: f32 = 3.9;
const PLACEHOLDER_PERCENT: i32 = 50;

pub struct Power {
    voltage: f32,
    percent: i32,
    charge_rate: f32,
    sensor_present: bool,
    #[cfg(target_os = "espidf")]
    i2c_installed: bool,
    #[cfg(not(target_os = "espidf"))]
    sim: SimPower,
}

#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
struct SimPower {
    config_pin_low: bool,
    battery: Option<(f32, i32, f32)>,
    sleep_hours: Option<i32>,
    teardown: Vec<&'static str>,
}

impl Power {
    pub fn new() -> Self {
        Self {
            voltage: PLACEHOLDER_VOLTAGE,
            percent: PLACEHOLDER_PERCENT,
            charge_rate: 0.0,
            sensor_present: false,
            #[cfg(target_os = "espidf")]
            i2c_installed: false,
            #[cfg(not(target_os = "espidf"))]
            sim: SimPower::default(),
        }
    }

    /// Probe and read the fuel gauge.
    ///
    /// Any I²C failure or out-of-range reading marks the sensor absent and
    /// leaves the placeholder values in place.
    pub fn init_battery_sensor(&mut self) {
        match self.read_gauge() {
            Some((voltage, percent, rate)) => {
                if voltage > 0.0 && voltage < 10.0 && (0..=100).contains(&percent) {
                    info!(
                        "battery: {:.2} V, {}%, {:+.1} %/h",
                        voltage, percent, rate
                    );
                    self.voltage = voltage;
                    self.percent = percent;
                    self.charge_rate = rate;
                    self.sensor_present = true;
                } else {
                    warn!(
                        "battery: implausible reading ({:.2} V / {}%), sensor marked absent",
                        voltage, percent
                    );
                }
            }
            None => warn!("battery: fuel gauge not responding, using placeholders"),
        }
    }

    pub fn battery_voltage(&self) -> f32 {
        self.voltage
    }

    pub fn battery_percentage(&self) -> i32 {
        self.percent.clamp(0, 100)
    }

    pub fn charge_rate(&self) -> f32 {
        self.charge_rate
    }

    pub fn battery_sensor_present(&self) -> bool {
        self.sensor_present
    }
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
impl Power {
    const I2C_PORT: i32 = 0;
    const I2C_TIMEOUT_TICKS: u32 = 100;

    fn ensure_i2c(&mut self) -> bool {
        use esp_idf_svc::sys::*;

        if self.i2c_installed {
            return true;
        }

        let mut cfg = i2c_config_t {
            mode: i2c_mode_t_I2C_MODE_MASTER,
            sda_io_num: pins::I2C_SDA_GPIO,
            scl_io_num: pins::I2C_SCL_GPIO,
            sda_pullup_en: true,
            scl_pullup_en: true,
            ..Default::default()
        };
        cfg.__bindgen_anon_1.master.clk_speed = 100_000;

        // SAFETY: single-threaded init path; port 0 is owned by this module.
        let rc = unsafe { i2c_param_config(Self::I2C_PORT, &cfg) };
        if rc != ESP_OK {
            warn!("power: i2c_param_config failed (rc={})", rc);
            return false;
        }
        let rc = unsafe { i2c_driver_install(Self::I2C_PORT, i2c_mode_t_I2C_MODE_MASTER, 0, 0, 0) };
        if rc != ESP_OK {
            warn!("power: i2c_driver_install failed (rc={})", rc);
            return false;
        }
        self.i2c_installed = true;
        true
    }

    fn read_reg16(&self, reg: u8) -> Option<u16> {
        use esp_idf_svc::sys::*;

        let mut buf = [0u8; 2];
        // SAFETY: buffers outlive the call; the driver is installed.
        let rc = unsafe {
            i2c_master_write_read_device(
                Self::I2C_PORT,
                FUEL_GAUGE_ADDR,
                [reg].as_ptr(),
                1,
                buf.as_mut_ptr(),
                2,
                Self::I2C_TIMEOUT_TICKS,
            )
        };
        (rc == ESP_OK).then(|| u16::from_be_bytes(buf))
    }

    fn write_reg16(&self, reg: u8, value: u16) -> bool {
        use esp_idf_svc::sys::*;

        let [hi, lo] = value.to_be_bytes();
        // SAFETY: buffer outlives the call; the driver is installed.
        let rc = unsafe {
            i2c_master_write_to_device(
                Self::I2C_PORT,
                FUEL_GAUGE_ADDR,
                [reg, hi, lo].as_ptr(),
                3,
                Self::I2C_TIMEOUT_TICKS,
            )
        };
        rc == ESP_OK
    }

    fn read_gauge(&mut self) -> Option<(f32, i32, f32)> {
        if !self.ensure_i2c() {
            return None;
        }
        // Wake the gauge out of hibernation before sampling.
        if !self.write_reg16(REG_HIBRT, 0x0000) {
            return None;
        }
        let vcell = self.read_reg16(REG_VCELL)?;
        let soc = self.read_reg16(REG_SOC)?;
        let crate_raw = self.read_reg16(REG_CRATE)? as i16;

        let voltage = f32::from(vcell) * 78.125e-6;
        let percent = i32::from(soc / 256);
        let rate = f32::from(crate_raw) * 0.208;
        Some((voltage, percent, rate))
    }

    /// The config jumper pulls the pin to ground; pull-up keeps it high
    /// otherwise.
    pub fn is_deep_sleep_disabled(&self) -> bool {
        use esp_idf_svc::sys::*;

        // SAFETY: plain GPIO register access on a pin this module owns.
        unsafe {
            gpio_set_direction(pins::CONFIG_DISABLE_GPIO, gpio_mode_t_GPIO_MODE_INPUT);
            gpio_set_pull_mode(pins::CONFIG_DISABLE_GPIO, gpio_pull_mode_t_GPIO_PULLUP_ONLY);
            gpio_get_level(pins::CONFIG_DISABLE_GPIO) == 0
        }
    }

    /// Tear down peripherals, float every driven pin and sleep for
    /// `hours`. Does not return.
    pub fn enter_deep_sleep(&mut self, hours: i32) -> ! {
        use esp_idf_svc::sys::*;

        let hours = if hours <= 0 {
            warn!("power: invalid sleep time, using 1 hour");
            1
        } else {
            hours
        };

        // 1. Hibernate the fuel gauge so it idles at a few µA.
        if self.sensor_present && !self.write_reg16(REG_HIBRT, 0xFFFF) {
            warn!("power: fuel gauge hibernate failed");
        }

        // SAFETY: final teardown path; nothing else touches peripherals
        // after this point.
        unsafe {
            // 2. Release the buses.
            if self.i2c_installed {
                i2c_driver_delete(Self::I2C_PORT);
            }
            spi_bus_free(spi_host_device_t_SPI2_HOST);

            // 3. High-Z every pin we ever drove; an armed pull leaks
            //    microamps for the whole sleep interval.
            for pin in pins::SLEEP_HIGH_Z_PINS {
                gpio_reset_pin(pin);
                gpio_set_direction(pin, gpio_mode_t_GPIO_MODE_INPUT);
                gpio_set_pull_mode(pin, gpio_pull_mode_t_GPIO_FLOATING);
            }

            // 4. The config pin keeps its pull-up: it is the only input
            //    the node accepts, and it must be readable at next boot.
            gpio_set_direction(pins::CONFIG_DISABLE_GPIO, gpio_mode_t_GPIO_MODE_INPUT);
            gpio_set_pull_mode(pins::CONFIG_DISABLE_GPIO, gpio_pull_mode_t_GPIO_PULLUP_ONLY);

            // 5. Power down the RTC domains and the crystal.
            esp_sleep_pd_config(
                esp_sleep_pd_domain_t_ESP_PD_DOMAIN_RTC_PERIPH,
                esp_sleep_pd_option_t_ESP_PD_OPTION_OFF,
            );
            esp_sleep_pd_config(
                esp_sleep_pd_domain_t_ESP_PD_DOMAIN_RTC_SLOW_MEM,
                esp_sleep_pd_option_t_ESP_PD_OPTION_OFF,
            );
            esp_sleep_pd_config(
                esp_sleep_pd_domain_t_ESP_PD_DOMAIN_RTC_FAST_MEM,
                esp_sleep_pd_option_t_ESP_PD_OPTION_OFF,
            );
            esp_sleep_pd_config(
                esp_sleep_pd_domain_t_ESP_PD_DOMAIN_XTAL,
                esp_sleep_pd_option_t_ESP_PD_OPTION_OFF,
            );

            // 6. Arm the wake timer.
            let sleep_us = u64::try_from(hours).unwrap_or(1) * 3600 * 1_000_000;
            info!("power: deep sleep for {} hour(s)", hours);
            esp_sleep_enable_timer_wakeup(sleep_us);

            // 7. Lights out.
            esp_deep_sleep_start();
            unreachable!("esp_deep_sleep_start returned");
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Host simulation backend
// ───────────────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
impl Power {
    fn read_gauge(&mut self) -> Option<(f32, i32, f32)> {
        self.sim.battery
    }

    pub fn is_deep_sleep_disabled(&self) -> bool {
        self.sim.config_pin_low
    }

    /// Records the teardown sequence and the requested duration instead of
    /// sleeping, so tests can assert on both.
    pub fn enter_deep_sleep(&mut self, hours: i32) {
        let hours = if hours <= 0 { 1 } else { hours };
        self.sim.teardown.clear();
        self.sim.teardown.extend([
            "gauge_hibernate",
            "bus_release",
            "pins_high_z",
            "config_pullup_kept",
            "rtc_domains_off",
            "timer_armed",
        ]);
        self.sim.sleep_hours = Some(hours);
        info!("power(sim): deep sleep for {} hour(s)", hours);
    }

    // ── Test hooks ────────────────────────────────────────────

    pub fn sim_set_battery(&mut self, voltage: f32, percent: i32, rate: f32) {
        self.sim.battery = Some((voltage, percent, rate));
    }

    pub fn sim_set_config_pin_low(&mut self, low: bool) {
        self.sim.config_pin_low = low;
    }

    pub fn sim_sleep_hours(&self) -> Option<i32> {
        self.sim.sleep_hours
    }

    pub fn sim_teardown(&self) -> &[&'static str] {
        &self.sim.teardown
    }
}
