//! Frame annotation: mirror flip, timestamp overlay and recording indicator.
//!
//! `annotate` is a pure function of its inputs. Text is rendered from a
//! small built-in 5x7 bitmap font scaled 2x, which covers exactly the
//! characters the overlays use.

use chrono::NaiveDateTime;

use crate::frame::{Frame, Rgb};

pub const TIMESTAMP_COLOR: Rgb = [0, 255, 0];
pub const REC_COLOR: Rgb = [255, 0, 0];

/// Baseline origin of the timestamp text.
pub const TIMESTAMP_ORIGIN: (i64, i64) = (10, 30);

/// Radius of the filled recording dot.
pub const REC_DOT_RADIUS: i64 = 10;

const GLYPH_WIDTH: i64 = 5;
const GLYPH_HEIGHT: i64 = 7;
const TEXT_SCALE: i64 = 2;
const GLYPH_ADVANCE: i64 = (GLYPH_WIDTH + 1) * TEXT_SCALE;

/// Center of the recording dot for a frame of the given width.
pub fn rec_dot_center(width: u32) -> (i64, i64) {
    (width as i64 - 30, 30)
}

/// Baseline origin of the "REC" label for a frame of the given width.
pub fn rec_label_origin(width: u32) -> (i64, i64) {
    (width as i64 - 80, 37)
}

/// Human-readable overlay timestamp, `YYYY-MM-DD HH:MM:SS`.
pub fn overlay_timestamp(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Mirror the frame, stamp the time, and mark it when recording.
pub fn annotate(mut frame: Frame, now: NaiveDateTime, recording: bool) -> Frame {
    let width = frame.width;
    frame.mirror_horizontal();

    draw_text(
        &mut frame,
        &overlay_timestamp(now),
        TIMESTAMP_ORIGIN,
        TIMESTAMP_COLOR,
    );

    if recording {
        fill_circle(
            &mut frame,
            rec_dot_center(width),
            REC_DOT_RADIUS,
            REC_COLOR,
        );
        draw_text(&mut frame, "REC", rec_label_origin(width), REC_COLOR);
    }

    frame
}

/// Width in pixels of `text` when rendered by `draw_text`.
pub fn text_width(text: &str) -> i64 {
    let chars = text.chars().count() as i64;
    if chars == 0 {
        0
    } else {
        chars * GLYPH_ADVANCE - TEXT_SCALE
    }
}

/// Render `text` with its baseline-left corner at `origin`.
fn draw_text(frame: &mut Frame, text: &str, origin: (i64, i64), color: Rgb) {
    let (mut x, baseline) = origin;
    let top = baseline - GLYPH_HEIGHT * TEXT_SCALE;
    for ch in text.chars() {
        if let Some(rows) = glyph(ch) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if bits & (0x10 >> col) == 0 {
                        continue;
                    }
                    let px = x + col * TEXT_SCALE;
                    let py = top + row as i64 * TEXT_SCALE;
                    for dy in 0..TEXT_SCALE {
                        for dx in 0..TEXT_SCALE {
                            frame.put_pixel(px + dx, py + dy, color);
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn fill_circle(frame: &mut Frame, center: (i64, i64), radius: i64, color: Rgb) {
    let (cx, cy) = center;
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy <= radius * radius {
                frame.put_pixel(cx + dx, cy + dy, color);
            }
        }
    }
}

// Rows top to bottom, bit 4 is the leftmost column.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        _ => return None,
    };
    Some(rows)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FRAME_HEIGHT, FRAME_WIDTH};
    use chrono::NaiveDate;

    const BACKGROUND: Rgb = [40, 40, 40];

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .expect("valid date")
    }

    fn blank() -> Frame {
        Frame::filled(FRAME_WIDTH, FRAME_HEIGHT, BACKGROUND)
    }

    fn count_color(frame: &Frame, x0: u32, y0: u32, x1: u32, y1: u32, color: Rgb) -> usize {
        let mut count = 0;
        for y in y0..y1 {
            for x in x0..x1 {
                if frame.pixel(x, y) == Some(color) {
                    count += 1;
                }
            }
        }
        count
    }

    #[test]
    fn timestamp_is_always_drawn() {
        for recording in [false, true] {
            let frame = annotate(blank(), noon(), recording);
            let width = text_width(&overlay_timestamp(noon())) as u32;
            assert!(count_color(&frame, 10, 16, 10 + width, 30, TIMESTAMP_COLOR) > 100);
        }
    }

    #[test]
    fn rec_indicator_only_when_recording() {
        let (cx, cy) = rec_dot_center(FRAME_WIDTH);
        let idle = annotate(blank(), noon(), false);
        assert_eq!(idle.pixel(cx as u32, cy as u32), Some(BACKGROUND));
        assert_eq!(
            count_color(&idle, FRAME_WIDTH - 90, 0, FRAME_WIDTH, 50, REC_COLOR),
            0
        );

        let live = annotate(blank(), noon(), true);
        assert_eq!(live.pixel(cx as u32, cy as u32), Some(REC_COLOR));
        let (lx, _) = rec_label_origin(FRAME_WIDTH);
        let label = count_color(
            &live,
            lx as u32,
            20,
            (lx + text_width("REC")) as u32,
            37,
            REC_COLOR,
        );
        assert!(label > 50, "REC label drawn, got {label} pixels");
    }

    #[test]
    fn rec_label_does_not_overlap_dot() {
        let (lx, _) = rec_label_origin(FRAME_WIDTH);
        let (cx, _) = rec_dot_center(FRAME_WIDTH);
        assert!(lx + text_width("REC") < cx - REC_DOT_RADIUS);
    }

    #[test]
    fn annotation_mirrors_the_frame() {
        let mut source = blank();
        source.put_pixel(600, 400, [1, 2, 3]);
        let frame = annotate(source, noon(), false);
        assert_eq!(frame.pixel(FRAME_WIDTH - 1 - 600, 400), Some([1, 2, 3]));
        assert_eq!(frame.pixel(600, 400), Some(BACKGROUND));
    }

    #[test]
    fn annotation_is_deterministic() {
        let a = annotate(blank(), noon(), true);
        let b = annotate(blank(), noon(), true);
        assert_eq!(a.pixels(), b.pixels());
    }

    #[test]
    fn overlay_timestamp_format() {
        assert_eq!(overlay_timestamp(noon()), "2024-01-01 12:00:00");
    }
}
