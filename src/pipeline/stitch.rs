//! Stitching: stack every page into one image.
//!
//! A single raster gives the whole invoice one coordinate plane: the model
//! sees the line-items table that continues on page 2 as the same table, and
//! the viewer draws every highlight on one canvas. Pages are scaled to a
//! common width so a column keeps its x position from page to page.

use crate::error::ExtractError;
use crate::schema::{PageSpan, PLANE};
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgba, RgbaImage};
use tracing::debug;

/// All pages of one run as a single image.
#[derive(Debug, Clone)]
pub struct StitchedImage {
    pub image: DynamicImage,
    /// Where each source page sits on the normalized plane.
    pub pages: Vec<PageSpan>,
}

impl StitchedImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// Pixel offset → normalized 0–1000 coordinate along an axis `extent` long.
pub fn to_normalized(px: f64, extent: u32) -> i32 {
    if extent == 0 {
        return 0;
    }
    ((px * PLANE as f64 / extent as f64).round() as i32).clamp(0, PLANE)
}

/// Normalized coordinate → pixel offset along an axis `extent` long.
pub fn to_pixels(n: i32, extent: u32) -> u32 {
    ((n.clamp(0, PLANE) as f64 * extent as f64 / PLANE as f64).round()) as u32
}

/// Stack `pages` top to bottom on white.
///
/// Every page is resized to the widest page's width (capped at `max_width`);
/// the stack is scaled down uniformly when taller than `max_height`.
pub fn stitch_pages(
    pages: Vec<DynamicImage>,
    max_width: u32,
    max_height: u32,
) -> Result<StitchedImage, ExtractError> {
    if pages.is_empty() {
        return Err(ExtractError::EmptyUpload {
            detail: "no pages to stitch".into(),
        });
    }

    if pages.len() == 1 {
        let mut pages = pages;
        let image = fit_height(fit_width(pages.remove(0), max_width), max_height);
        return Ok(StitchedImage {
            image,
            pages: vec![PageSpan {
                page: 1,
                y1: 0,
                y2: PLANE,
            }],
        });
    }

    let width = pages
        .iter()
        .map(|p| p.width())
        .max()
        .unwrap_or(1)
        .clamp(1, max_width.max(1));

    let scaled: Vec<RgbaImage> = pages
        .into_iter()
        .map(|page| {
            if page.width() == width {
                page.to_rgba8()
            } else {
                let height = scaled_extent(page.height(), page.width(), width);
                page.resize_exact(width, height, FilterType::Triangle).to_rgba8()
            }
        })
        .collect();

    let total_height: u32 = scaled.iter().map(|p| p.height()).sum();
    let mut canvas = RgbaImage::from_pixel(width, total_height, Rgba([255, 255, 255, 255]));

    let mut spans = Vec::with_capacity(scaled.len());
    let mut y = 0u32;
    for (idx, page) in scaled.iter().enumerate() {
        imageops::overlay(&mut canvas, page, 0, y as i64);
        let y1 = to_normalized(y as f64, total_height);
        y += page.height();
        let y2 = to_normalized(y as f64, total_height);
        spans.push(PageSpan {
            page: idx + 1,
            y1,
            y2,
        });
    }

    debug!(
        "Stitched {} pages into {}x{} px",
        spans.len(),
        width,
        total_height
    );

    Ok(StitchedImage {
        image: fit_height(DynamicImage::ImageRgba8(canvas), max_height),
        pages: spans,
    })
}

/// `extent` scaled by `target / source`, at least 1 px.
fn scaled_extent(extent: u32, source: u32, target: u32) -> u32 {
    ((extent as u64 * target as u64) / source.max(1) as u64).max(1) as u32
}

fn fit_width(image: DynamicImage, max_width: u32) -> DynamicImage {
    let max_width = max_width.max(1);
    if image.width() <= max_width {
        return image;
    }
    let height = scaled_extent(image.height(), image.width(), max_width);
    image.resize_exact(max_width, height, FilterType::Triangle)
}

fn fit_height(image: DynamicImage, max_height: u32) -> DynamicImage {
    if image.height() <= max_height {
        return image;
    }
    let width = scaled_extent(image.width(), image.height(), max_height);
    image.resize_exact(width, max_height, FilterType::Triangle)
}
