//! Display renderer.
//!
//! Translates a [`PlantSnapshot`](crate::snapshot::PlantSnapshot) into a
//! tri-colour dashboard: a centred header (title, update date, battery
//! icon) above a 3×2 grid of semicircular moisture gauges. Layout is
//! computed at render time in [`layout`]; no fixed pixel tables.
//!
//! The panel itself sits behind the [`Surface`] port: pixel/line/rect/text
//! primitives plus the paged-refresh protocol (`first_page` … `next_page`
//! until the driver reports completion). The device adapter lives in
//! [`epd`]; tests use [`RecordingSurface`].

pub mod draw;
pub mod layout;
pub mod screens;

#[cfg(target_os = "espidf")]
pub mod epd;

use crate::config::{GAUGE_COLS, GAUGE_ROWS, MAX_PLANTS, SCREEN_H, SCREEN_W};
use crate::snapshot::PlantSnapshot;

/// Tri-colour ink state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ink {
    White,
    Black,
    Red,
}

/// The e-paper collaborator: a tri-colour framebuffer with paged refresh.
///
/// Text is drawn from the driver's built-in 6×8 font scaled by `size`;
/// [`layout::text_width`] mirrors those metrics so layout stays pure.
pub trait Surface {
    fn fill(&mut self, ink: Ink);
    fn draw_pixel(&mut self, x: i32, y: i32, ink: Ink);
    fn draw_line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, ink: Ink);
    fn draw_rect(&mut self, x: i32, y: i32, w: i32, h: i32, ink: Ink);
    fn fill_rect(&mut self, x: i32, y: i32, w: i32, h: i32, ink: Ink);
    /// Draw `text` with its top-left corner at (`x`, `y`).
    fn draw_text(&mut self, x: i32, y: i32, text: &str, size: i32, ink: Ink);

    /// Begin a paged full-window refresh.
    fn first_page(&mut self);
    /// Finish the current page; returns `false` once the refresh is done.
    fn next_page(&mut self) -> bool;

    /// Put the panel into its lowest-power state.
    fn hibernate(&mut self);
    /// Re-initialise the panel after [`hibernate`](Surface::hibernate).
    fn wake(&mut self) {}
}

/// Render the full dashboard for one snapshot.
///
/// Two renders with the same snapshot and battery reading issue an
/// identical primitive sequence, so refreshes are idempotent.
pub fn render_dashboard(surface: &mut impl Surface, snapshot: &PlantSnapshot, battery_pct: i32) {
    surface.first_page();
    loop {
        surface.fill(Ink::White);

        let header_h = draw_header(surface, &snapshot.update_date, battery_pct);

        let cell_w = SCREEN_W / GAUGE_COLS as i32;
        let cell_h = (SCREEN_H - header_h) / GAUGE_ROWS as i32;
        for (idx, plant) in snapshot.plants.iter().take(MAX_PLANTS).enumerate() {
            let col = (idx % GAUGE_COLS) as i32;
            let row = (idx / GAUGE_COLS) as i32;
            draw_gauge(
                surface,
                col * cell_w,
                header_h + row * cell_h,
                cell_w,
                cell_h,
                &plant.name,
                plant.moisture,
            );
        }

        if !surface.next_page() {
            break;
        }
    }
}

/// Draw the header band; returns its total height.
fn draw_header(surface: &mut impl Surface, update_date: &str, battery_pct: i32) -> i32 {
    let header = layout::header_layout(update_date, battery_pct);

    surface.draw_text(header.title_x, header.title_y, layout::TITLE, 2, Ink::Black);
    surface.draw_text(header.line_x, header.line_y, &header.line_text, 1, Ink::Black);

    draw::battery_icon(surface, header.icon_x, header.line_y, battery_pct);
    surface.draw_text(
        header.pct_x,
        header.line_y,
        &header.pct_text,
        1,
        header.battery_ink,
    );

    // Three 1-px separator lines, inset 10 px from each edge.
    for i in 0..3 {
        surface.draw_line(
            10,
            header.separator_y + i,
            SCREEN_W - 10,
            header.separator_y + i,
            Ink::Black,
        );
    }

    header.height
}

/// Draw one moisture gauge inside the cell at (`x`, `y`).
fn draw_gauge(surface: &mut impl Surface, x: i32, y: i32, w: i32, h: i32, name: &str, moisture: i32) {
    let gauge = layout::gauge_layout(x, y, w, h, moisture);

    // Background arc: concentric 1-px passes for a smooth thick stroke.
    for r in (gauge.radius - gauge.bg_thickness)..=gauge.radius {
        draw::smooth_arc(surface, gauge.center_x, gauge.center_y, r, 180, 360, Ink::Black);
    }

    // Value arc, inner to the background.
    if gauge.sweep_deg > 0 {
        let outer = gauge.radius - gauge.bg_thickness - 1;
        let inner = gauge.radius - gauge.bg_thickness - gauge.value_thickness;
        for r in inner..=outer {
            draw::smooth_arc(
                surface,
                gauge.center_x,
                gauge.center_y,
                r,
                180,
                180 + gauge.sweep_deg,
                gauge.value_ink,
            );
        }
    }

    surface.draw_text(
        gauge.pct_text_x,
        gauge.pct_text_y,
        &gauge.pct_text,
        2,
        gauge.value_ink,
    );

    if let Some((low_x, low_y)) = gauge.low_label {
        surface.draw_text(low_x, low_y, layout::LOW_LABEL, 1, Ink::Red);
    }

    let name = layout::shorten_name(name, w - 4);
    let name_x = gauge.center_x - layout::text_width(&name, 1) / 2;
    surface.draw_text(name_x, gauge.name_y, &name, 1, Ink::Black);
}

// ───────────────────────────────────────────────────────────────
// Recording surface (host builds and tests)
// ───────────────────────────────────────────────────────────────

/// One recorded primitive call.
#[cfg(not(target_os = "espidf"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Fill(Ink),
    Pixel(i32, i32, Ink),
    Line(i32, i32, i32, i32, Ink),
    Rect(i32, i32, i32, i32, Ink),
    FillRect(i32, i32, i32, i32, Ink),
    Text {
        x: i32,
        y: i32,
        text: String,
        size: i32,
        ink: Ink,
    },
    FirstPage,
    NextPage,
    Hibernate,
}

/// Surface double that records every primitive for assertions.
#[cfg(not(target_os = "espidf"))]
#[derive(Default)]
pub struct RecordingSurface {
    pub ops: Vec<Op>,
}

#[cfg(not(target_os = "espidf"))]
impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded text draws (content, size, ink).
    pub fn texts(&self) -> Vec<(&str, i32, Ink)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Text { text, size, ink, .. } => Some((text.as_str(), *size, *ink)),
                _ => None,
            })
            .collect()
    }

    pub fn hibernated(&self) -> bool {
        self.ops.contains(&Op::Hibernate)
    }
}

#[cfg(not(target_os = "espidf"))]
impl Surface for RecordingSurface {
    fn fill(&mut self, ink: Ink) {
        self.ops.push(Op::Fill(ink));
    }

    fn draw_pixel(&mut self, x: i32, y: i32, ink: Ink) {
        self.ops.push(Op::Pixel(x, y, ink));
    }

    fn draw_line(&mut self, x0: i32, y0: i32, x1: i32, y1: i32, ink: Ink) {
        self.ops.push(Op::Line(x0, y0, x1, y1, ink));
    }

    fn draw_rect(&mut self, x: i32, y: i32, w: i32, h: i32, ink: Ink) {
        self.ops.push(Op::Rect(x, y, w, h, ink));
    }

    fn fill_rect(&mut self, x: i32, y: i32, w: i32, h: i32, ink: Ink) {
        self.ops.push(Op::FillRect(x, y, w, h, ink));
    }

    fn draw_text(&mut self, x: i32, y: i32, text: &str, size: i32, ink: Ink) {
        self.ops.push(Op::Text {
            x,
            y,
            text: text.to_owned(),
            size,
            ink,
        });
    }

    fn first_page(&mut self) {
        self.ops.push(Op::FirstPage);
    }

    fn next_page(&mut self) -> bool {
        self.ops.push(Op::NextPage);
        false
    }

    fn hibernate(&mut self) {
        self.ops.push(Op::Hibernate);
    }
}
