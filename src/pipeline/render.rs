//! Page rasterisation: uploads → one `DynamicImage` per page.
//!
//! PDFs go through pdfium inside `spawn_blocking`: pdfium is a C++ library
//! with thread-local state and must not run on a Tokio worker thread. PNG and
//! JPEG uploads are decoded with the `image` crate, also off the async
//! threads since large scans take tens of milliseconds to decode.
//!
//! The page budget (`max_pages`) is enforced across all uploads of a run,
//! and checked before any page of a PDF is rendered.

use crate::config::ExtractionConfig;
use crate::error::ExtractError;
use crate::pipeline::input::{Upload, UploadKind};
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// Turn every upload into page images, in upload order.
pub async fn load_pages(
    uploads: Vec<Upload>,
    config: &ExtractionConfig,
) -> Result<Vec<DynamicImage>, ExtractError> {
    if uploads.is_empty() {
        return Err(ExtractError::EmptyUpload {
            detail: "no files were uploaded".into(),
        });
    }

    let mut pages = Vec::new();
    for upload in uploads {
        let budget = config.max_pages.saturating_sub(pages.len());
        match upload.kind()? {
            UploadKind::Pdf => {
                let already = pages.len();
                let rendered = render_pdf(upload, config, budget)
                    .await
                    .map_err(|e| match e {
                        ExtractError::TooManyPages { pages, max } => ExtractError::TooManyPages {
                            pages: already + pages,
                            max: already + max,
                        },
                        other => other,
                    })?;
                pages.extend(rendered);
            }
            UploadKind::Png | UploadKind::Jpeg => {
                if budget == 0 {
                    return Err(ExtractError::TooManyPages {
                        pages: pages.len() + 1,
                        max: config.max_pages,
                    });
                }
                pages.push(decode_image(upload).await?);
            }
        }
    }

    info!("Loaded {} page(s)", pages.len());
    Ok(pages)
}

/// Decode a PNG or JPEG upload.
pub async fn decode_image(upload: Upload) -> Result<DynamicImage, ExtractError> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&upload.bytes).map_err(|e| ExtractError::ImageDecodeFailed {
            name: upload.name.clone(),
            detail: e.to_string(),
        })
    })
    .await
    .map_err(|e| ExtractError::Internal(format!("Decode task panicked: {}", e)))?
}

/// Rasterise every page of a PDF upload.
///
/// `budget` is the number of pages still allowed in this run; a PDF with
/// more pages fails with [`ExtractError::TooManyPages`] before rendering.
pub async fn render_pdf(
    upload: Upload,
    config: &ExtractionConfig,
    budget: usize,
) -> Result<Vec<DynamicImage>, ExtractError> {
    let dpi = config.dpi;
    let max_pixels = config.max_rendered_pixels;
    let password = config.password.clone();

    tokio::task::spawn_blocking(move || {
        render_pdf_blocking(&upload, dpi, max_pixels, password.as_deref(), budget)
    })
    .await
    .map_err(|e| ExtractError::Internal(format!("Render task panicked: {}", e)))?
}

/// Bind pdfium from `PDFIUM_LIB_PATH` (file or directory) or the system.
pub fn bind_pdfium() -> Result<Pdfium, ExtractError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => {
            let path = Path::new(&path);
            let lib = if path.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(path)
            } else {
                path.to_path_buf()
            };
            Pdfium::bind_to_library(lib)
        }
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| ExtractError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

fn render_pdf_blocking(
    upload: &Upload,
    dpi: u32,
    max_pixels: u32,
    password: Option<&str>,
    budget: usize,
) -> Result<Vec<DynamicImage>, ExtractError> {
    let pdfium = bind_pdfium()?;
    let name = upload.name.clone();

    let document = pdfium
        .load_pdf_from_byte_slice(&upload.bytes, password)
        .map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.contains("Password") || err_str.contains("password") {
                if password.is_some() {
                    ExtractError::WrongPassword { name: name.clone() }
                } else {
                    ExtractError::PasswordRequired { name: name.clone() }
                }
            } else {
                ExtractError::CorruptPdf {
                    name: name.clone(),
                    detail: err_str,
                }
            }
        })?;

    let pages = document.pages();
    let total = pages.len() as usize;
    info!("PDF '{}' loaded: {} pages", name, total);

    if total == 0 {
        return Err(ExtractError::EmptyUpload {
            detail: format!("'{name}' has no pages"),
        });
    }
    if total > budget {
        return Err(ExtractError::TooManyPages {
            pages: total,
            max: budget,
        });
    }

    let mut images = Vec::with_capacity(total);
    for (idx, page) in pages.iter().enumerate() {
        let target_width = page_width_px(page.width().value, dpi, max_pixels);
        let render_config = PdfRenderConfig::new()
            .set_target_width(target_width)
            .set_maximum_height(max_pixels as i32);

        let bitmap = page.render_with_config(&render_config).map_err(|e| {
            ExtractError::RasterisationFailed {
                name: name.clone(),
                page: idx + 1,
                detail: format!("{:?}", e),
            }
        })?;

        let image = bitmap.as_image();
        debug!(
            "Rendered '{}' page {} → {}x{} px",
            name,
            idx + 1,
            image.width(),
            image.height()
        );
        images.push(image);
    }

    Ok(images)
}

/// Pixel width for a page `width_pts` points wide at `dpi`, capped.
fn page_width_px(width_pts: f32, dpi: u32, max_pixels: u32) -> i32 {
    let px = (width_pts / 72.0 * dpi as f32).round() as i32;
    px.clamp(1, max_pixels as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_upload(name: &str, w: u32, h: u32) -> Upload {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        Upload::new(name, buf)
    }

    #[test]
    fn a4_width_at_150_dpi() {
        // A4 is 595 pt wide.
        assert_eq!(page_width_px(595.0, 150, 2000), 1240);
        assert_eq!(page_width_px(595.0, 400, 2000), 2000);
    }

    #[tokio::test]
    async fn decodes_png_upload() {
        let img = decode_image(png_upload("scan.png", 12, 7)).await.unwrap();
        assert_eq!((img.width(), img.height()), (12, 7));
    }

    #[tokio::test]
    async fn corrupt_png_is_reported_by_name() {
        let mut upload = png_upload("broken.png", 4, 4);
        upload.bytes.truncate(12);
        let err = decode_image(upload).await.unwrap_err();
        assert!(err.to_string().contains("broken.png"), "got: {err}");
    }

    #[tokio::test]
    async fn image_uploads_count_against_page_budget() {
        let config = ExtractionConfig::builder().max_pages(2).build().unwrap();
        let uploads = vec![
            png_upload("a.png", 4, 4),
            png_upload("b.png", 4, 4),
            png_upload("c.png", 4, 4),
        ];
        let err = load_pages(uploads, &config).await.unwrap_err();
        assert!(matches!(err, ExtractError::TooManyPages { pages: 3, max: 2 }));
    }

    #[tokio::test]
    async fn no_uploads_is_empty_upload() {
        let config = ExtractionConfig::default();
        let err = load_pages(Vec::new(), &config).await.unwrap_err();
        assert!(matches!(err, ExtractError::EmptyUpload { .. }));
    }

    #[tokio::test]
    async fn images_keep_upload_order() {
        let config = ExtractionConfig::default();
        let pages = load_pages(
            vec![png_upload("a.png", 3, 3), png_upload("b.png", 5, 2)],
            &config,
        )
        .await
        .unwrap();
        assert_eq!(pages[0].width(), 3);
        assert_eq!(pages[1].width(), 5);
    }
}
