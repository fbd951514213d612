//! Pure layout computation for the dashboard.
//!
//! Everything here is deterministic integer geometry so it can be tested
//! on the host. Text metrics assume the panel's 6×8 cell font scaled by
//! the text size; drivers must match.

use core::fmt::Write as _;

use super::Ink;
use crate::config::{BATTERY_LOW_THRESHOLD, MOISTURE_LOW_THRESHOLD, SCREEN_W};

pub const TITLE: &str = "PLANT MOISTURE";
pub const LOW_LABEL: &str = "LOW!";

/// Glyph cell width at size 1.
pub const GLYPH_W: i32 = 6;
/// Glyph cell height at size 1.
pub const GLYPH_H: i32 = 8;

/// Horizontal space reserved for the battery icon in the header line.
pub const BATTERY_ICON_SPAN: i32 = 20;
/// Gap between the icon span and the percentage text.
pub const BATTERY_ICON_GAP: i32 = 4;

/// Pixel width of `text` at the given size.
pub fn text_width(text: &str, size: i32) -> i32 {
    text.chars().count() as i32 * GLYPH_W * size
}

/// Pixel height of a text line at the given size.
pub fn text_height(size: i32) -> i32 {
    GLYPH_H * size
}

/// Filled sweep of the value arc in degrees: `round(180 · pct / 100)`
/// after clamping.
pub fn sweep_degrees(pct: i32) -> i32 {
    (pct.clamp(0, 100) * 180 + 50) / 100
}

/// The ink used for a gauge's value arc and percentage.
pub fn moisture_ink(pct: i32) -> Ink {
    if pct < MOISTURE_LOW_THRESHOLD {
        Ink::Red
    } else {
        Ink::Black
    }
}

/// The ink used for the header battery icon and percentage.
pub fn battery_ink(pct: i32) -> Ink {
    if pct < BATTERY_LOW_THRESHOLD {
        Ink::Red
    } else {
        Ink::Black
    }
}

// ───────────────────────────────────────────────────────────────
// Header
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderLayout {
    pub title_x: i32,
    pub title_y: i32,
    /// `"Updated: <date> Battery: "`; the icon and percentage follow.
    pub line_text: String,
    pub line_x: i32,
    pub line_y: i32,
    pub icon_x: i32,
    pub pct_text: String,
    pub pct_x: i32,
    pub battery_ink: Ink,
    pub separator_y: i32,
    /// Total header height; the gauge grid starts here.
    pub height: i32,
}

pub fn header_layout(update_date: &str, battery_pct: i32) -> HeaderLayout {
    let title_y = 4;
    let line_y = title_y + text_height(2) + 4;

    let mut line_text = String::new();
    let _ = write!(line_text, "Updated: {} Battery: ", update_date);
    let mut pct_text = String::new();
    let _ = write!(pct_text, "{}%", battery_pct);

    let line_w = text_width(&line_text, 1);
    let total_w = line_w + BATTERY_ICON_SPAN + BATTERY_ICON_GAP + text_width(&pct_text, 1);
    let line_x = (SCREEN_W - total_w) / 2;
    let icon_x = line_x + line_w;
    let pct_x = icon_x + BATTERY_ICON_SPAN + BATTERY_ICON_GAP;

    let separator_y = line_y + text_height(1) + 4;

    HeaderLayout {
        title_x: (SCREEN_W - text_width(TITLE, 2)) / 2,
        title_y,
        line_text,
        line_x,
        line_y,
        icon_x,
        pct_text,
        pct_x,
        battery_ink: battery_ink(battery_pct),
        separator_y,
        height: separator_y + 3,
    }
}

// ───────────────────────────────────────────────────────────────
// Gauge
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaugeLayout {
    pub center_x: i32,
    pub center_y: i32,
    pub radius: i32,
    pub bg_thickness: i32,
    pub value_thickness: i32,
    pub sweep_deg: i32,
    pub value_ink: Ink,
    pub pct_text: String,
    pub pct_text_x: i32,
    pub pct_text_y: i32,
    /// Present only below the moisture threshold.
    pub low_label: Option<(i32, i32)>,
    pub name_y: i32,
}

pub fn gauge_layout(x: i32, y: i32, w: i32, h: i32, moisture: i32) -> GaugeLayout {
    let moisture = moisture.clamp(0, 100);
    let center_x = x + w / 2;

    // 10% top padding, 40% of the height for the gauge itself; the radius
    // must also clear the cell walls.
    let top_pad = h / 10;
    let radius = (h * 2 / 5).min(w / 2 - 10);
    let center_y = y + top_pad + radius;

    let bg_thickness = (radius / 8).max(6);
    let value_thickness = (radius / 6).max(8);
    let value_ink = moisture_ink(moisture);

    let mut pct_text = String::new();
    let _ = write!(pct_text, "{}%", moisture);
    let pct_text_x = center_x - text_width(&pct_text, 2) / 2;
    let pct_text_y = center_y + 5;

    let low_label = (moisture < MOISTURE_LOW_THRESHOLD).then(|| {
        (
            center_x - text_width(LOW_LABEL, 1) / 2,
            pct_text_y + text_height(2) + 2,
        )
    });

    GaugeLayout {
        center_x,
        center_y,
        radius,
        bg_thickness,
        value_thickness,
        sweep_deg: sweep_degrees(moisture),
        value_ink,
        pct_text,
        pct_text_x,
        pct_text_y,
        low_label,
        name_y: y + h - 5 - text_height(1),
    }
}

/// Fit a plant name into `max_w` pixels at size 1.
///
/// Too-wide two-word names shrink to `"First L."`; if that still
/// overflows, the first word alone is used. Single-word names are left
/// as-is.
pub fn shorten_name(name: &str, max_w: i32) -> String {
    if text_width(name, 1) <= max_w {
        return name.to_owned();
    }
    let Some((first, rest)) = name.split_once(' ') else {
        return name.to_owned();
    };
    if let Some(initial) = rest.chars().next() {
        let abbreviated = format!("{} {}.", first, initial);
        if text_width(&abbreviated, 1) <= max_w {
            return abbreviated;
        }
    }
    first.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_boundaries() {
        assert_eq!(sweep_degrees(0), 0);
        assert_eq!(sweep_degrees(100), 180);
        assert_eq!(sweep_degrees(50), 90);
        assert_eq!(sweep_degrees(72), 130);
        assert_eq!(sweep_degrees(-5), 0);
        assert_eq!(sweep_degrees(140), 180);
    }

    #[test]
    fn sweep_matches_rounded_fraction_for_all_pct() {
        for pct in 0..=100 {
            let exact = f64::from(pct) * 180.0 / 100.0;
            let got = f64::from(sweep_degrees(pct));
            assert!((got - exact).abs() <= 1.0, "pct={pct}: {got} vs {exact}");
        }
    }

    #[test]
    fn moisture_threshold_is_exclusive_at_35() {
        assert_eq!(moisture_ink(34), Ink::Red);
        assert_eq!(moisture_ink(35), Ink::Black);
    }

    #[test]
    fn battery_threshold_is_exclusive_at_10() {
        assert_eq!(battery_ink(9), Ink::Red);
        assert_eq!(battery_ink(10), Ink::Black);
    }

    #[test]
    fn header_is_centred_and_stacked() {
        let header = header_layout("2025-10-03 22:30", 87);
        assert_eq!(header.title_x, (SCREEN_W - text_width(TITLE, 2)) / 2);
        assert!(header.title_y < header.line_y);
        assert!(header.line_y < header.separator_y);
        assert_eq!(header.height, header.separator_y + 3);
        // Line 2 sits centred including icon and percentage.
        let total = text_width(&header.line_text, 1)
            + BATTERY_ICON_SPAN
            + BATTERY_ICON_GAP
            + text_width(&header.pct_text, 1);
        assert_eq!(header.line_x, (SCREEN_W - total) / 2);
        assert!(header.pct_x > header.icon_x);
    }

    #[test]
    fn header_height_is_stable_across_dates() {
        let a = header_layout("2025-01-01 00:00", 50);
        let b = header_layout("ERROR", 50);
        assert_eq!(a.height, b.height);
    }

    #[test]
    fn gauge_radius_respects_both_limits() {
        // Wide cell: height-limited.
        let g = gauge_layout(0, 39, 133, 130, 50);
        assert_eq!(g.radius, (130 * 2 / 5).min(133 / 2 - 10));
        // Narrow cell: width-limited.
        let g = gauge_layout(0, 0, 60, 200, 50);
        assert_eq!(g.radius, 60 / 2 - 10);
    }

    #[test]
    fn gauge_thickness_floors() {
        let g = gauge_layout(0, 39, 133, 130, 50);
        assert_eq!(g.bg_thickness, (g.radius / 8).max(6));
        assert_eq!(g.value_thickness, (g.radius / 6).max(8));
        assert!(g.bg_thickness >= 6);
        assert!(g.value_thickness >= 8);
    }

    #[test]
    fn low_label_only_below_threshold() {
        assert!(gauge_layout(0, 0, 133, 130, 12).low_label.is_some());
        assert!(gauge_layout(0, 0, 133, 130, 35).low_label.is_none());
    }

    #[test]
    fn shorten_name_progression() {
        let max_w = text_width("Monstera D.", 1);
        assert_eq!(shorten_name("Monstera Deliciosa", max_w), "Monstera D.");
        let tight = text_width("Monstera", 1);
        assert_eq!(shorten_name("Monstera Deliciosa", tight), "Monstera");
    }

    #[test]
    fn short_names_pass_through() {
        assert_eq!(shorten_name("Basil", 129), "Basil");
    }

    #[test]
    fn single_word_names_are_never_cut() {
        let name = "Extraordinarily-long-cultivar";
        assert_eq!(shorten_name(name, 10), name);
    }
}
