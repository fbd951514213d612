//! Static screens: first-boot provisioning and the OTA banner.

use core::fmt::Write as _;

use qrcodegen::{QrCode, QrCodeEcc};

use super::{Ink, Surface, layout};
use crate::config::{SCREEN_H, SCREEN_W};

/// QR module size in panel pixels.
const QR_SCALE: i32 = 4;

/// Show the provisioning screen: the soft-AP credentials in text plus a
/// Wi-Fi QR code so a phone can join with one scan. Content is advisory;
/// the portal does the real work.
pub fn render_config_screen(surface: &mut impl Surface, ssid: &str, password: &str) {
    let mut wifi_uri = String::new();
    let _ = write!(wifi_uri, "WIFI:T:WPA;S:{};P:{};;", ssid, password);
    let qr = QrCode::encode_text(&wifi_uri, QrCodeEcc::Medium).ok();

    surface.first_page();
    loop {
        surface.fill(Ink::White);

        let centred = |text: &str, size: i32| (SCREEN_W - layout::text_width(text, size)) / 2;

        surface.draw_text(centred("SETUP MODE", 2), 12, "SETUP MODE", 2, Ink::Red);
        surface.draw_text(
            centred("Connect to this WiFi network:", 1),
            40,
            "Connect to this WiFi network:",
            1,
            Ink::Black,
        );
        surface.draw_text(centred(ssid, 2), 54, ssid, 2, Ink::Black);
        surface.draw_text(centred("Password:", 1), 78, "Password:", 1, Ink::Black);
        surface.draw_text(centred(password, 2), 92, password, 2, Ink::Black);

        if let Some(qr) = &qr {
            draw_qr(surface, qr, 120);
        }

        surface.draw_text(
            centred("Then open http://192.168.71.1 to configure", 1),
            SCREEN_H - 20,
            "Then open http://192.168.71.1 to configure",
            1,
            Ink::Black,
        );

        if !surface.next_page() {
            break;
        }
    }
}

/// Show the OTA banner before the download starts. The panel keeps this
/// image until the post-update boot renders a fresh dashboard.
pub fn render_upgrade_screen(surface: &mut impl Surface) {
    surface.first_page();
    loop {
        surface.fill(Ink::White);

        let centred = |text: &str, size: i32| (SCREEN_W - layout::text_width(text, size)) / 2;
        let mid = SCREEN_H / 2;

        surface.draw_text(
            centred("Updating firmware...", 2),
            mid - layout::text_height(2),
            "Updating firmware...",
            2,
            Ink::Black,
        );
        surface.draw_text(
            centred("Do not disconnect power", 1),
            mid + 8,
            "Do not disconnect power",
            1,
            Ink::Red,
        );

        if !surface.next_page() {
            break;
        }
    }
}

fn draw_qr(surface: &mut impl Surface, qr: &QrCode, top: i32) {
    let modules = qr.size();
    let span = modules * QR_SCALE;
    let left = (SCREEN_W - span) / 2;

    for my in 0..modules {
        for mx in 0..modules {
            if qr.get_module(mx, my) {
                surface.fill_rect(
                    left + mx * QR_SCALE,
                    top + my * QR_SCALE,
                    QR_SCALE,
                    QR_SCALE,
                    Ink::Black,
                );
            }
        }
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;
    use crate::display::{Op, RecordingSurface};

    #[test]
    fn config_screen_shows_credentials_and_qr() {
        let mut surface = RecordingSurface::new();
        render_config_screen(&mut surface, "e-paper-display", "a1B2c3D4");
        let texts = surface.texts();
        assert!(texts.iter().any(|(t, size, _)| *t == "e-paper-display" && *size == 2));
        assert!(texts.iter().any(|(t, _, _)| *t == "a1B2c3D4"));
        // QR modules are the only small filled squares on this screen.
        let modules = surface
            .ops
            .iter()
            .filter(|op| matches!(op, Op::FillRect(_, _, w, h, Ink::Black) if *w == QR_SCALE && *h == QR_SCALE))
            .count();
        assert!(modules > 100, "QR code should render, got {modules} modules");
    }

    #[test]
    fn upgrade_screen_shows_banner() {
        let mut surface = RecordingSurface::new();
        render_upgrade_screen(&mut surface);
        assert!(surface
            .texts()
            .iter()
            .any(|(t, size, _)| *t == "Updating firmware..." && *size == 2));
    }
}
