//! Driver adapter: [`Surface`] over the 4.2" 400×300 B/W/R panel.
//!
//! Generic over `embedded-hal` traits so the panel wiring stays at the
//! call site. Two bit-planes (black and red, 1 bpp each, MSB first) are
//! kept in RAM and pushed over SPI in one transfer, so the "paged"
//! protocol collapses to a single page. Command set follows the
//! UC8176-class controller used by this panel generation.

use embedded_graphics::Drawable;
use embedded_graphics::draw_target::DrawTarget;
use embedded_graphics::geometry::{OriginDimensions, Point, Size};
use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::mono_font::ascii::FONT_6X10;
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::text::{Baseline, Text};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiDevice;
use log::{info, warn};

use super::{Ink, Surface};
use crate::config::{SCREEN_H, SCREEN_W};

const PLANE_BYTES: usize = (SCREEN_W as usize / 8) * SCREEN_H as usize;
/// Refresh of a tri-colour panel takes ~15 s; allow a wide margin.
const BUSY_TIMEOUT_MS: u32 = 30_000;

// Controller commands.
const CMD_PANEL_SETTING: u8 = 0x00;
const CMD_POWER_SETTING: u8 = 0x01;
const CMD_POWER_OFF: u8 = 0x02;
const CMD_POWER_ON: u8 = 0x04;
const CMD_BOOSTER_SOFT_START: u8 = 0x06;
const CMD_DEEP_SLEEP: u8 = 0x07;
const CMD_DATA_BW: u8 = 0x10;
const CMD_REFRESH: u8 = 0x12;
const CMD_DATA_RED: u8 = 0x13;
const CMD_RESOLUTION: u8 = 0x61;

pub struct Epd<SPI, BUSY, DC, RST, DELAY> {
    spi: SPI,
    busy: BUSY,
    dc: DC,
    rst: RST,
    delay: DELAY,
    /// 1 = white, 0 = black.
    bw: Vec<u8>,
    /// 1 = neutral, 0 = red.
    red: Vec<u8>,
    initialised: bool,
}

impl<SPI, BUSY, DC, RST, DELAY> Epd<SPI, BUSY, DC, RST, DELAY>
where
    SPI: SpiDevice,
    BUSY: InputPin,
    DC: OutputPin,
    RST: OutputPin,
    DELAY: DelayNs,
{
    /// Create the driver, reset the panel and run the init sequence.
    pub fn new(spi: SPI, busy: BUSY, dc: DC, rst: RST, delay: DELAY) -> Result<Self, SPI::Error> {
        let mut epd = Self {
            spi,
            busy,
            dc,
            rst,
            delay,
            bw: vec![0xFF; PLANE_BYTES],
            red: vec![0xFF; PLANE_BYTES],
            initialised: false,
        };
        epd.init()?;
        Ok(epd)
    }

    fn hardware_reset(&mut self) {
        let _ = self.rst.set_low();
        self.delay.delay_ms(10);
        let _ = self.rst.set_high();
        self.delay.delay_ms(10);
    }

    /// BUSY is held low while the controller works.
    fn wait_until_idle(&mut self) {
        let mut waited = 0;
        while self.busy.is_low().unwrap_or(true) {
            self.delay.delay_ms(10);
            waited += 10;
            if waited >= BUSY_TIMEOUT_MS {
                warn!("epd: busy timeout after {} ms", waited);
                return;
            }
        }
    }

    fn send_command(&mut self, command: u8) -> Result<(), SPI::Error> {
        let _ = self.dc.set_low();
        self.spi.write(&[command])
    }

    fn send_data(&mut self, data: &[u8]) -> Result<(), SPI::Error> {
        let _ = self.dc.set_high();
        self.spi.write(data)
    }

    fn cmd_with_data(&mut self, command: u8, data: &[u8]) -> Result<(), SPI::Error> {
        self.send_command(command)?;
        self.send_data(data)
    }

    fn init(&mut self) -> Result<(), SPI::Error> {
        self.hardware_reset();

        self.cmd_with_data(CMD_POWER_SETTING, &[0x03, 0x00, 0x2B, 0x2B])?;
        self.cmd_with_data(CMD_BOOSTER_SOFT_START, &[0x17, 0x17, 0x17])?;
        self.send_command(CMD_POWER_ON)?;
        self.wait_until_idle();
        // OTP LUT, B/W/R mode, default scan directions.
        self.cmd_with_data(CMD_PANEL_SETTING, &[0x0F])?;
        self.cmd_with_data(
            CMD_RESOLUTION,
            &[
                (SCREEN_W >> 8) as u8,
                (SCREEN_W & 0xFF) as u8,
                (SCREEN_H >> 8) as u8,
                (SCREEN_H & 0xFF) as u8,
            ],
        )?;
        self.initialised = true;
        info!("epd: panel initialised");
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SPI::Error> {
        self.send_command(CMD_DATA_BW)?;
        let _ = self.dc.set_high();
        self.spi.write(&self.bw)?;
        self.send_command(CMD_DATA_RED)?;
        let _ = self.dc.set_high();
        self.spi.write(&self.red)?;
        self.send_command(CMD_REFRESH)?;
        Ok(())
    }

    fn set_pixel(&mut self, x: i32, y: i32, ink: Ink) {
        if !(0..SCREEN_W).contains(&x) || !(0..SCREEN_H).contains(&y) {
            return;
        }
        let index = (y * (SCREEN_W / 8) + x / 8) as usize;
        let mask = 0x80 >> (x % 8);
        match ink {
            Ink::White => {
                self.bw[index] |= mask;
                self.red[index] |= mask;
            }
            Ink::Black => {
                self.bw[index] &= !mask;
                self.red[index] |= mask;
            }
            Ink::Red => {
                self.bw[index] |= mask;
                self.red[index] &= !mask;
            }
        }
    }
}

impl<SPI, BUSY, DC, RST, DELAY> Surface for Epd<SPI, BUSY, DC, RST, DELAY>
where
    SPI: SpiDevice,
    BUSY: InputPin,
    DC: OutputPin,
    RST: OutputPin,
    DELAY: DelayNs,
{
    fn fill(&mut self, ink: Ink) {
        let (bw, red) = match ink {
            Ink::White => (0xFF, 0xFF),
            Ink::Black => (0x00, 0xFF),
            Ink::Red => (0xFF, 0x00),
        };
        self.bw.fill(bw);
        self.red.fill(red);
    }

    fn draw_pixel(&mut self, x: i32, y: i32, ink: Ink) {
        self.set_pixel(x, y, ink);
    }

    fn draw_line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, ink: Ink) {
        // Bresenham.
        let dx = (x1 - x0).abs();
        let dy = -(y1 - y0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let (mut x, mut y) = (x0, y0);
        loop {
            self.set_pixel(x, y, ink);
            if x == x1 && y == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x += sx;
            }
            if e2 <= dx {
                err += dx;
                y += sy;
            }
        }
    }

    fn draw_rect(&mut self, x: i32, y: i32, w: i32, h: i32, ink: Ink) {
        if w <= 0 || h <= 0 {
            return;
        }
        self.draw_line(x, y, x + w - 1, y, ink);
        self.draw_line(x, y + h - 1, x + w - 1, y + h - 1, ink);
        self.draw_line(x, y, x, y + h - 1, ink);
        self.draw_line(x + w - 1, y, x + w - 1, y + h - 1, ink);
    }

    fn fill_rect(&mut self, x: i32, y: i32, w: i32, h: i32, ink: Ink) {
        for yy in y..y + h {
            for xx in x..x + w {
                self.set_pixel(xx, yy, ink);
            }
        }
    }

    fn draw_text(&mut self, x: i32, y: i32, text: &str, size: i32, ink: Ink) {
        let scale = size.max(1);
        let style = MonoTextStyle::new(&FONT_6X10, BinaryColor::On);
        let mut canvas = GlyphCanvas {
            plot: |gx: i32, gy: i32| {
                let base_x = x + gx * scale;
                let base_y = y + gy * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        self.set_pixel(base_x + dx, base_y + dy, ink);
                    }
                }
            },
        };
        let _ = Text::with_baseline(text, Point::zero(), style, Baseline::Top).draw(&mut canvas);
    }

    fn first_page(&mut self) {
        if !self.initialised {
            self.wake();
        }
    }

    fn next_page(&mut self) -> bool {
        match self.flush() {
            Ok(()) => self.wait_until_idle(),
            Err(err) => warn!("epd: frame transfer failed: {err:?}"),
        }
        false
    }

    fn hibernate(&mut self) {
        let result = self.send_command(CMD_POWER_OFF).and_then(|()| {
            self.wait_until_idle();
            self.cmd_with_data(CMD_DEEP_SLEEP, &[0xA5])
        });
        if let Err(err) = result {
            warn!("epd: hibernate failed: {err:?}");
        }
        self.initialised = false;
    }

    fn wake(&mut self) {
        if let Err(err) = self.init() {
            warn!("epd: re-init failed: {err:?}");
        }
    }
}

/// Routes glyph pixels from `embedded-graphics` into the bit-planes,
/// scaled by an integer factor so size-2 text reuses the 6-px font.
struct GlyphCanvas<F> {
    plot: F,
}

impl<F: FnMut(i32, i32)> OriginDimensions for GlyphCanvas<F> {
    fn size(&self) -> Size {
        Size::new(SCREEN_W as u32, SCREEN_H as u32)
    }
}

impl<F: FnMut(i32, i32)> DrawTarget for GlyphCanvas<F> {
    type Color = BinaryColor;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = embedded_graphics::Pixel<Self::Color>>,
    {
        for embedded_graphics::Pixel(point, colour) in pixels {
            if colour.is_on() {
                (self.plot)(point.x, point.y);
            }
        }
        Ok(())
    }
}
