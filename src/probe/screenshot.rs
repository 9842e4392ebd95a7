//! Text-card PNG rendering for probed services.
//!
//! Not a browser screenshot: a fixed-width card summarising what the probe
//! saw (scheme, title, banner, status, snippet), rendered with an 8x8
//! bitmap font.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use font8x8::legacy::BASIC_LEGACY;
use image::{Rgb, RgbImage};

use crate::output::HttpService;

const WIDTH: u32 = 800;
const LINE_HEIGHT: u32 = 20;
const PADDING: u32 = 16;
const GLYPH_SIZE: u32 = 8;
const BACKGROUND: Rgb<u8> = Rgb([18, 18, 18]);
const FOREGROUND: Rgb<u8> = Rgb([220, 220, 220]);

/// Renders and writes the PNG for one probed service. Returns the file
/// path, empty only when rendering was skipped.
pub(crate) fn capture(
    dir: &Path,
    hostname: &str,
    scheme: &str,
    service: &HttpService,
) -> Result<String> {
    let mut lines = vec![format!("{scheme}://{hostname}")];
    if !service.title.is_empty() {
        lines.push(format!("Title: {}", service.title));
    }
    if !service.banner.is_empty() {
        lines.push(format!("Banner: {}", service.banner));
    }
    if service.status_code > 0 {
        lines.push(format!("Status: {}", service.status_code));
    }
    if !service.snippet.is_empty() {
        lines.push(format!("Snippet: {}", service.snippet));
    }

    let image = render(&lines);
    let filename = format!("{}_{scheme}.png", sanitize_filename(hostname));
    let path: PathBuf = dir.join(filename);
    image
        .save(&path)
        .with_context(|| format!("writing screenshot {}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

fn render(lines: &[String]) -> RgbImage {
    let height = PADDING * 2 + LINE_HEIGHT * lines.len().max(1) as u32;
    let mut image = RgbImage::from_pixel(WIDTH, height, BACKGROUND);

    for (index, line) in lines.iter().enumerate() {
        let y = PADDING + index as u32 * LINE_HEIGHT;
        draw_text(&mut image, PADDING, y, line);
    }

    image
}

fn draw_text(image: &mut RgbImage, origin_x: u32, origin_y: u32, text: &str) {
    let mut x = origin_x;
    for ch in text.chars() {
        if x + GLYPH_SIZE > WIDTH - PADDING {
            break; // clip long lines at the right margin
        }
        let glyph = glyph_for(ch);
        for (row_index, row) in glyph.iter().enumerate() {
            for bit in 0..8u32 {
                if row & (1 << bit) != 0 {
                    let px = x + bit;
                    let py = origin_y + row_index as u32;
                    if px < WIDTH && py < image.height() {
                        image.put_pixel(px, py, FOREGROUND);
                    }
                }
            }
        }
        x += GLYPH_SIZE;
    }
}

fn glyph_for(ch: char) -> [u8; 8] {
    let index = ch as usize;
    if index < BASIC_LEGACY.len() {
        BASIC_LEGACY[index]
    } else {
        BASIC_LEGACY[b'?' as usize]
    }
}

/// Keeps `[A-Za-z0-9._-]`, replaces everything else with `_`, and never
/// returns an empty name.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => ch,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim_matches('_');
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_and_trims() {
        assert_eq!(sanitize_filename("www.example.com"), "www.example.com");
        assert_eq!(sanitize_filename("host:8080/x"), "host_8080_x");
        assert_eq!(sanitize_filename("***"), "unknown");
        assert_eq!(sanitize_filename(""), "unknown");
    }

    #[test]
    fn render_produces_fixed_width_card() {
        let image = render(&["http://example.com".to_string(), "Status: 200".to_string()]);
        assert_eq!(image.width(), 800);
        assert_eq!(image.height(), PADDING * 2 + LINE_HEIGHT * 2);
        // Some foreground pixels were drawn.
        assert!(image.pixels().any(|pixel| *pixel == FOREGROUND));
    }

    #[test]
    fn capture_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        let service = HttpService {
            url: "http://example.com".into(),
            status_code: 200,
            title: "Example".into(),
            ..HttpService::default()
        };

        let path = capture(dir.path(), "example.com", "http", &service).unwrap();
        assert!(path.ends_with("example.com_http.png"));
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }
}
