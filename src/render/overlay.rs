//! Wall-clock timestamp watermark.
//!
//! A fixed 400x44 overlay holding `yyyy-MM-dd HH:mm:ss`, shaped with glyphon
//! (cosmic-text) from an embedded monospace font. The text is reshaped only
//! when the displayed second changes. The CPU path rasterizes it through the
//! swash cache into an RGBA image; the GPU path hands the shaped buffer to a
//! glyphon `TextRenderer`.

use chrono::{DateTime, Local};
use glyphon::{fontdb, Attrs, Buffer, Color, Family, FontSystem, Metrics, Shaping, SwashCache};
use image::{Rgba, RgbaImage};

use crate::media::FrameSize;

pub const OVERLAY_WIDTH: u32 = 400;
pub const OVERLAY_HEIGHT: u32 = 44;

static OVERLAY_FONT: &[u8] = include_bytes!("fonts/DejaVuSansMono.ttf");
const FONT_FAMILY: &str = "DejaVu Sans Mono";
const FONT_SIZE: f32 = 26.0;
const LINE_HEIGHT: f32 = 32.0;

/// Text origin inside the overlay, in pixels.
pub(crate) const TEXT_LEFT: f32 = 12.0;
pub(crate) const TEXT_TOP: f32 = (OVERLAY_HEIGHT as f32 - LINE_HEIGHT) / 2.0;

pub(crate) const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 128]);
pub(crate) const TEXT_COLOR: Color = Color::rgb(255, 255, 255);

/// Placement of the overlay inside a frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl OverlayRect {
    /// Top-left placement at 1% of the frame size, clipped to the frame.
    pub fn for_frame(frame: FrameSize) -> Self {
        let x = frame.width / 100;
        let y = frame.height / 100;
        Self {
            x,
            y,
            width: OVERLAY_WIDTH.min(frame.width.saturating_sub(x)),
            height: OVERLAY_HEIGHT.min(frame.height.saturating_sub(y)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

fn overlay_font_system() -> FontSystem {
    let mut db = fontdb::Database::new();
    db.load_font_data(OVERLAY_FONT.to_vec());
    FontSystem::new_with_locale_and_db("en-US".to_string(), db)
}

/// Per-pipeline timestamp text.
pub struct TimestampOverlay {
    font_system: FontSystem,
    swash_cache: SwashCache,
    buffer: Buffer,
    image: RgbaImage,
    text: String,
    shown: Option<i64>,
    /// The raster is behind the shaped text.
    stale: bool,
    redraws: u64,
}

impl Default for TimestampOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampOverlay {
    pub fn new() -> Self {
        let mut font_system = overlay_font_system();
        let mut buffer = Buffer::new(&mut font_system, Metrics::new(FONT_SIZE, LINE_HEIGHT));
        buffer.set_size(
            &mut font_system,
            Some(OVERLAY_WIDTH as f32 - TEXT_LEFT),
            Some(LINE_HEIGHT),
        );
        Self {
            font_system,
            swash_cache: SwashCache::new(),
            buffer,
            image: RgbaImage::from_pixel(OVERLAY_WIDTH, OVERLAY_HEIGHT, BACKGROUND),
            text: String::new(),
            shown: None,
            stale: false,
            redraws: 0,
        }
    }

    /// Reshape for `now` if the second changed. Returns true when it did.
    pub fn update(&mut self, now: DateTime<Local>) -> bool {
        let second = now.timestamp();
        if self.shown == Some(second) {
            return false;
        }
        self.text = now.format("%Y-%m-%d %H:%M:%S").to_string();
        let attrs = Attrs::new().family(Family::Name(FONT_FAMILY));
        self.buffer.set_text(
            &mut self.font_system,
            &self.text,
            &attrs,
            Shaping::Advanced,
        );
        self.buffer.shape_until_scroll(&mut self.font_system, false);
        self.shown = Some(second);
        self.stale = true;
        self.redraws += 1;
        true
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn redraw_count(&self) -> u64 {
        self.redraws
    }

    /// CPU raster of the current text over the translucent background.
    pub fn raster(&mut self) -> &RgbaImage {
        if self.stale {
            self.rasterize();
            self.stale = false;
        }
        &self.image
    }

    /// Shaped text for a glyphon `TextRenderer`, with the font system and
    /// cache it was shaped against.
    #[cfg(feature = "gpu")]
    pub(crate) fn glyphon_parts(&mut self) -> (&mut FontSystem, &mut SwashCache, &Buffer) {
        (&mut self.font_system, &mut self.swash_cache, &self.buffer)
    }

    fn rasterize(&mut self) {
        let Self {
            font_system,
            swash_cache,
            buffer,
            image,
            ..
        } = self;
        for pixel in image.pixels_mut() {
            *pixel = BACKGROUND;
        }
        let left = TEXT_LEFT as i32;
        let top = TEXT_TOP as i32;
        buffer.draw(font_system, swash_cache, TEXT_COLOR, |x, y, w, h, color| {
            if color.a() == 0 {
                return;
            }
            for dy in 0..h as i32 {
                for dx in 0..w as i32 {
                    let (px, py) = (left + x + dx, top + y + dy);
                    if px < 0 || py < 0 || px >= OVERLAY_WIDTH as i32 || py >= OVERLAY_HEIGHT as i32 {
                        continue;
                    }
                    blend_pixel(image.get_pixel_mut(px as u32, py as u32), color);
                }
            }
        });
    }
}

fn blend_pixel(dst: &mut Rgba<u8>, src: Color) {
    let alpha = src.a() as u32;
    for (channel, value) in [src.r(), src.g(), src.b()].into_iter().enumerate() {
        dst.0[channel] = ((value as u32 * alpha + dst.0[channel] as u32 * (255 - alpha)) / 255) as u8;
    }
    dst.0[3] = dst.0[3].max(src.a());
}

/// Alpha-blend `overlay` onto a tightly packed RGBA frame at `rect`.
pub fn blend_overlay(frame: &mut [u8], frame_size: FrameSize, overlay: &RgbaImage, rect: OverlayRect) {
    let stride = frame_size.width as usize * 4;
    for oy in 0..rect.height.min(overlay.height()) {
        for ox in 0..rect.width.min(overlay.width()) {
            let src = overlay.get_pixel(ox, oy).0;
            let alpha = src[3] as u32;
            if alpha == 0 {
                continue;
            }
            let offset = (rect.y + oy) as usize * stride + (rect.x + ox) as usize * 4;
            let Some(dst) = frame.get_mut(offset..offset + 4) else {
                continue;
            };
            for channel in 0..3 {
                let blended = (src[channel] as u32 * alpha + dst[channel] as u32 * (255 - alpha)) / 255;
                dst[channel] = blended as u8;
            }
            dst[3] = 255;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32, nanos: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 9, h, m, s)
            .single()
            .unwrap()
            .with_nanosecond(nanos)
            .unwrap()
    }

    #[test]
    fn test_redraws_only_when_second_changes() {
        let mut overlay = TimestampOverlay::new();
        assert!(overlay.update(at(10, 0, 0, 0)));
        assert!(!overlay.update(at(10, 0, 0, 500_000_000)));
        assert!(overlay.update(at(10, 0, 1, 0)));
        assert_eq!(overlay.redraw_count(), 2);
    }

    #[test]
    fn test_text_pixels_are_drawn() {
        let mut overlay = TimestampOverlay::new();
        overlay.update(at(12, 34, 56, 0));
        assert_eq!(overlay.text(), "2024-03-09 12:34:56");
        let raster = overlay.raster();
        assert_eq!(raster.dimensions(), (OVERLAY_WIDTH, OVERLAY_HEIGHT));
        let lit = raster.pixels().filter(|p| p.0[0] > 200).count();
        assert!(lit > 100, "only {} text pixels", lit);
        // Nothing lands left of the text origin
        assert!((0..TEXT_LEFT as u32 - 2)
            .all(|x| (0..OVERLAY_HEIGHT).all(|y| *raster.get_pixel(x, y) == BACKGROUND)));
    }

    #[test]
    fn test_raster_follows_text_changes() {
        let mut overlay = TimestampOverlay::new();
        overlay.update(at(8, 0, 0, 0));
        let first = overlay.raster().clone();
        assert_eq!(overlay.raster(), &first);
        overlay.update(at(8, 0, 1, 0));
        assert_ne!(overlay.raster(), &first);
    }

    #[test]
    fn test_rect_is_one_percent_from_corner() {
        let rect = OverlayRect::for_frame(FrameSize::new(1280, 800));
        assert_eq!((rect.x, rect.y, rect.width, rect.height), (12, 8, 400, 44));

        let small = OverlayRect::for_frame(FrameSize::new(64, 48));
        assert_eq!((small.width, small.height), (64, 44));
    }

    #[test]
    fn test_blend_overlay() {
        let size = FrameSize::new(4, 1);
        let mut frame = vec![0u8; size.rgba_len()];
        let overlay = RgbaImage::from_pixel(2, 1, Rgba([255, 255, 255, 255]));
        let rect = OverlayRect {
            x: 1,
            y: 0,
            width: 2,
            height: 1,
        };
        blend_overlay(&mut frame, size, &overlay, rect);
        assert_eq!(&frame[0..4], &[0, 0, 0, 0]);
        assert_eq!(&frame[4..8], &[255, 255, 255, 255]);
        assert_eq!(&frame[12..16], &[0, 0, 0, 0]);
    }
}
