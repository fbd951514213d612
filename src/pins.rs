//! GPIO / peripheral pin assignments for the display node board.
//!
//! Single source of truth: every driver references this module rather
//! than hard-coding pin numbers.

// ---------------------------------------------------------------------------
// E-paper panel (SPI)
// ---------------------------------------------------------------------------

/// Panel chip select.
pub const EPD_CS_GPIO: i32 = 12;
/// Data/command select.
pub const EPD_DC_GPIO: i32 = 17;
/// Panel reset (active low).
pub const EPD_RST_GPIO: i32 = 16;
/// Panel busy indicator (input).
pub const EPD_BUSY_GPIO: i32 = 13;
/// SPI clock.
pub const SPI_SCK_GPIO: i32 = 18;
/// SPI MOSI (panel DIN).
pub const SPI_MOSI_GPIO: i32 = 23;

// ---------------------------------------------------------------------------
// I²C bus (MAX17048 fuel gauge)
// ---------------------------------------------------------------------------

pub const I2C_SDA_GPIO: i32 = 21;
pub const I2C_SCL_GPIO: i32 = 22;

// ---------------------------------------------------------------------------
// Config mode
// ---------------------------------------------------------------------------

/// Input with pull-up; pulled LOW by a jumper/button to force the config
/// portal and inhibit deep sleep. This pull-up is the only one left armed
/// during deep sleep so the jumper is observable on the next boot.
pub const CONFIG_DISABLE_GPIO: i32 = 4;

/// Every general-purpose pin the firmware drives. All of these are set to
/// high-Z with pulls disabled before deep sleep; the config pin is handled
/// separately.
pub const SLEEP_HIGH_Z_PINS: [i32; 8] = [
    EPD_CS_GPIO,
    EPD_DC_GPIO,
    EPD_RST_GPIO,
    EPD_BUSY_GPIO,
    SPI_SCK_GPIO,
    SPI_MOSI_GPIO,
    I2C_SDA_GPIO,
    I2C_SCL_GPIO,
];
