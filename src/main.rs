//! Plant Moisture Display: ESP-IDF entry point.
//!
//! One-shot wake cycle: construct the adapters, run the orchestrator to
//! completion, then map the outcome onto a soft reset or timed deep
//! sleep. There is no steady-state loop.
//!
//! ```text
//!  Settings (NVS)  Power (I²C gauge + sleep)  Network (WiFi/MQTT)
//!        └──────────────┬──────────────────────────┘
//!                 cycle::run_cycle
//!        ┌──────────────┴──────────────────────────┐
//!  Epd panel (SPI Surface)              OtaEngine + HttpFetcher
//! ```
#![deny(unused_must_use)]

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::PinDriver;
use esp_idf_hal::spi::config::{Config as SpiConfig, DriverConfig};
use esp_idf_hal::spi::{SpiDeviceDriver, SpiDriver};
use esp_idf_hal::units::FromValueType;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::prelude::Peripherals;
use esp_idf_svc::log::EspLogger;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::info;

use plantpanel::config;
use plantpanel::cycle::{self, CycleOutcome};
use plantpanel::display::epd::Epd;
use plantpanel::net::Network;
use plantpanel::ota::{HttpFetcher, OtaEngine};
use plantpanel::power::Power;
use plantpanel::settings::Settings;

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    info!("=== Plant Moisture Display ===");
    info!("firmware {}", config::firmware_version());

    // Let the pins settle after boot before sampling the config jumper.
    thread::sleep(Duration::from_millis(100));

    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let settings = Settings::new(nvs.clone());
    let mut power = Power::new();
    let mut net = Network::new(peripherals.modem, sysloop, nvs, settings.clone())?;

    let spi = SpiDriver::new(
        peripherals.spi2,
        pins.gpio18,
        pins.gpio23,
        Option::<esp_idf_hal::gpio::Gpio19>::None,
        &DriverConfig::new(),
    )
    .context("SPI bus init failed")?;
    let spi = SpiDeviceDriver::new(spi, Some(pins.gpio12), &SpiConfig::new().baudrate(10.MHz().into()))
        .context("SPI device init failed")?;
    let mut panel = Epd::new(
        spi,
        PinDriver::input(pins.gpio13)?,
        PinDriver::output(pins.gpio17)?,
        PinDriver::output(pins.gpio16)?,
        FreeRtos,
    )
    .context("panel init failed")?;

    let engine = OtaEngine::from_build_key();
    let outcome = cycle::run_cycle(
        &settings,
        &mut power,
        &mut net,
        &mut panel,
        &engine,
        HttpFetcher,
    );

    match outcome {
        CycleOutcome::Reboot { delay_ms } => {
            if delay_ms > 0 {
                thread::sleep(Duration::from_millis(u64::from(delay_ms)));
            }
            info!("restarting");
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        CycleOutcome::Sleep { hours } => {
            // Release the SPI bus and radio before the pin teardown.
            drop(panel);
            drop(net);
            power.enter_deep_sleep(hours);
        }
    }
}
