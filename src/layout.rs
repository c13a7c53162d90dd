//! Snapshot to bitmap. Everything here is pure: the same snapshot always yields
//! the same pixels and the same hash.

use crate::state::{SystemSnapshot, TailscaleStatus};
use embedded_graphics::mono_font::iso_8859_1::{FONT_5X8, FONT_6X13};
use embedded_graphics::mono_font::{MonoFont, MonoTextStyle};
use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::Rectangle;
use embedded_graphics::text::{Baseline, Text};
use std::convert::Infallible;
use std::ops::Range;

pub const PLACEHOLDER: &str = "--";

const SLOT_COUNT: u32 = 12;
const LABEL_COLUMN_CHARS: u32 = 6;
const LARGE_FONT_MIN_HEIGHT: u32 = 168;
const LEFT_MARGIN: i32 = 1;

/// 1bpp image: rows top to bottom, each padded to a whole byte, MSB is the
/// leftmost pixel, a set bit is black.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width.div_ceil(8) as usize;
        Self {
            width,
            height,
            data: vec![0; stride * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.width.div_ceil(8) as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn index(&self, x: u32, y: u32) -> Option<(usize, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let byte = y as usize * self.stride() + (x / 8) as usize;
        Some((byte, 0x80 >> (x % 8)))
    }

    /// Out of bounds writes are dropped.
    pub fn set_pixel(&mut self, x: u32, y: u32, black: bool) {
        if let Some((byte, mask)) = self.index(x, y) {
            if black {
                self.data[byte] |= mask;
            } else {
                self.data[byte] &= !mask;
            }
        }
    }

    /// Raw bytes of the given pixel rows.
    #[cfg(test)]
    pub fn rows(&self, rows: Range<u32>) -> &[u8] {
        let end = rows.end.min(self.height) as usize;
        let start = (rows.start as usize).min(end);
        &self.data[start * self.stride()..end * self.stride()]
    }

    /// Binary PBM (P4). Its raster layout is the same as ours.
    pub fn to_pbm(&self) -> Vec<u8> {
        let mut out = format!("P4\n{} {}\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.data);
        out
    }
}

impl OriginDimensions for Bitmap {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for Bitmap {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(Point { x, y }, color) in pixels {
            if x < 0 || y < 0 {
                continue;
            }
            self.set_pixel(x as u32, y as u32, color.is_on());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    pub bitmap: Bitmap,
    pub content_hash: u32,
}

impl DisplayFrame {
    pub fn new(bitmap: Bitmap) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bitmap.width.to_le_bytes());
        hasher.update(&bitmap.height.to_le_bytes());
        hasher.update(&bitmap.data);
        Self {
            content_hash: hasher.finalize(),
            bitmap,
        }
    }
}

/// Screen lines, top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Host,
    Cpu,
    Temperature,
    Memory,
    Disk,
    Battery,
    Load,
    Uptime,
    Address,
    Network,
    Wifi,
    Tailscale,
}

impl Slot {
    pub const ALL: [Slot; SLOT_COUNT as usize] = [
        Slot::Host,
        Slot::Cpu,
        Slot::Temperature,
        Slot::Memory,
        Slot::Disk,
        Slot::Battery,
        Slot::Load,
        Slot::Uptime,
        Slot::Address,
        Slot::Network,
        Slot::Wifi,
        Slot::Tailscale,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Slot::Host => "Host:",
            Slot::Cpu => "CPU:",
            Slot::Temperature => "Temp:",
            Slot::Memory => "Mem:",
            Slot::Disk => "Disk:",
            Slot::Battery => "Bat:",
            Slot::Load => "Load:",
            Slot::Uptime => "Up:",
            Slot::Address => "IP:",
            Slot::Network => "Net:",
            Slot::Wifi => "WiFi:",
            Slot::Tailscale => "TS:",
        }
    }

    fn line(self) -> u32 {
        self as u32
    }
}

pub struct LayoutEngine {
    width: u32,
    height: u32,
    font: &'static MonoFont<'static>,
    line_pitch: u32,
    value_x: i32,
}

impl LayoutEngine {
    pub fn new(width: u32, height: u32) -> Self {
        let font = if height >= LARGE_FONT_MIN_HEIGHT {
            &FONT_6X13
        } else {
            &FONT_5X8
        };
        let glyph = font.character_size;
        let advance = glyph.width + font.character_spacing;
        Self {
            width,
            height,
            font,
            line_pitch: (height / SLOT_COUNT).max(glyph.height),
            value_x: LEFT_MARGIN + (LABEL_COLUMN_CHARS * advance) as i32,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn render(&self, snapshot: &SystemSnapshot) -> DisplayFrame {
        let mut bitmap = Bitmap::new(self.width, self.height);
        for slot in Slot::ALL {
            self.draw_line(&mut bitmap, slot, &value_text(slot, snapshot));
        }
        DisplayFrame::new(bitmap)
    }

    /// Pixel rows owned by `slot`, clipped to the panel.
    pub fn slot_rows(&self, slot: Slot) -> Range<u32> {
        let top = slot.line() * self.line_pitch;
        let bottom = top + self.line_pitch;
        top.min(self.height)..bottom.min(self.height)
    }

    /// Draws one label/value line. Nothing is drawn outside the slot's rows.
    pub fn draw_line(&self, bitmap: &mut Bitmap, slot: Slot, value: &str) {
        let rows = self.slot_rows(slot);
        if rows.is_empty() {
            return;
        }
        let area = Rectangle::new(
            Point::new(0, rows.start as i32),
            Size::new(self.width, rows.end - rows.start),
        );
        let style = MonoTextStyle::new(self.font, BinaryColor::On);
        let mut target = bitmap.clipped(&area);
        let top = rows.start as i32;

        // Infallible target.
        let label = Point::new(LEFT_MARGIN, top);
        let _ = Text::with_baseline(slot.label(), label, style, Baseline::Top).draw(&mut target);
        let value_at = Point::new(self.value_x, top);
        let _ = Text::with_baseline(value, value_at, style, Baseline::Top).draw(&mut target);
    }
}

/// Text shown in the value column of `slot`.
pub fn value_text(slot: Slot, snapshot: &SystemSnapshot) -> String {
    let value = match slot {
        Slot::Host => snapshot.host_name.clone(),
        Slot::Cpu => snapshot.cpu_load_pct.map(|pct| format!("{pct:.0}%")),
        Slot::Temperature => snapshot.cpu_temperature_c.map(|c| format!("{c:.1}°C")),
        Slot::Memory => snapshot
            .mem_used_bytes
            .zip(snapshot.mem_total_bytes)
            .map(|(used, total)| format!("{}/{} MB", megabytes(used), megabytes(total))),
        Slot::Disk => snapshot
            .disk_free_bytes
            .zip(snapshot.disk_total_bytes)
            .map(|(free, total)| format!("{:.1}/{:.1} GB free", gigabytes(free), gigabytes(total))),
        Slot::Battery => snapshot.battery_pct.map(|pct| match snapshot.battery_charging {
            Some(true) => format!("{pct}% Charging"),
            Some(false) => format!("{pct}% Discharging"),
            None => format!("{pct}%"),
        }),
        Slot::Load => snapshot
            .load_average
            .map(|l| format!("{:.2} {:.2} {:.2}", l.one, l.five, l.fifteen)),
        Slot::Uptime => snapshot.uptime_seconds.map(format_uptime),
        Slot::Address => snapshot.ip_address.clone(),
        Slot::Network => snapshot
            .net_sent_bytes
            .zip(snapshot.net_recv_bytes)
            .map(|(tx, rx)| {
                format!(
                    "tx {:.1} rx {:.1} MB",
                    tx as f64 / 1e6,
                    rx as f64 / 1e6
                )
            }),
        Slot::Wifi => snapshot.wifi_ssid.clone(),
        Slot::Tailscale => snapshot.tailscale.as_ref().map(|ts| match ts {
            TailscaleStatus::Up(address) => address.clone(),
            TailscaleStatus::Down => "Down".to_string(),
        }),
    };
    value.unwrap_or_else(|| PLACEHOLDER.to_string())
}

fn megabytes(bytes: u64) -> u64 {
    (bytes as f64 / 1e6).round() as u64
}

fn gigabytes(bytes: u64) -> f64 {
    bytes as f64 / 1e9
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = seconds % 86_400 / 3_600;
    let minutes = seconds % 3_600 / 60;
    format!("{days}d {hours:02}:{minutes:02}")
}
