//! Shared drawing helpers: smooth arcs and the battery icon.

use super::{Ink, Surface};
use crate::display::layout::battery_ink;

/// Draw a 1-px arc as line segments sampled at 1° steps.
///
/// Angles are in degrees, measured clockwise with 0° at the positive x
/// axis; the gauges use 180°→360° for the lower semicircle. Line segments
/// beat raw pixel plotting here: at 1° steps adjacent samples can be more
/// than one pixel apart on large radii.
pub fn smooth_arc(
    surface: &mut impl Surface,
    cx: i32,
    cy: i32,
    radius: i32,
    start_deg: i32,
    end_deg: i32,
    ink: Ink,
) {
    if radius <= 0 || end_deg <= start_deg {
        return;
    }

    let point = |deg: i32| {
        let rad = (deg as f32).to_radians();
        (
            cx + (radius as f32 * rad.cos()).round() as i32,
            cy + (radius as f32 * rad.sin()).round() as i32,
        )
    };

    let (mut prev_x, mut prev_y) = point(start_deg);
    for deg in (start_deg + 1)..=end_deg {
        let (x, y) = point(deg);
        surface.draw_line(prev_x, prev_y, x, y, ink);
        prev_x = x;
        prev_y = y;
    }
}

/// Battery body width/height and terminal nub dimensions.
const BODY_W: i32 = 16;
const BODY_H: i32 = 8;
const NUB_W: i32 = 2;
const NUB_H: i32 = 4;

/// Draw the header battery icon at (`x`, `y`): a 16×8 outline with a 2×4
/// terminal nub and a proportional fill. Renders red below the low
/// threshold.
pub fn battery_icon(surface: &mut impl Surface, x: i32, y: i32, pct: i32) {
    let ink = battery_ink(pct);
    let pct = pct.clamp(0, 100);

    surface.draw_rect(x, y, BODY_W, BODY_H, ink);
    surface.fill_rect(x + BODY_W, y + (BODY_H - NUB_H) / 2, NUB_W, NUB_H, ink);

    // Fill is clipped to the interior of the 1-px outline.
    let fill = ((BODY_W - 2) * pct / 100).min(BODY_W - 4);
    if fill > 0 {
        surface.fill_rect(x + 2, y + 2, fill, BODY_H - 4, ink);
    }
}
