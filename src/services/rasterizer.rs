use std::io::Cursor;

use image::ImageFormat;
use pdfium_render::prelude::*;

use crate::domain::error::EngineError;

/// One rendered page, ready for the vision channel.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page_number: u32,
    pub png_bytes: Vec<u8>,
    pub mime_type: &'static str,
}

/// Splits an uploaded document into per-page images. CPU-bound; callers run
/// it off the async path via `spawn_blocking`.
pub trait PageRasterizer: Send + Sync {
    fn rasterize(&self, bytes: &[u8], dpi: u32) -> Result<Vec<PageImage>, EngineError>;
}

/// pdfium-backed rasterizer for PDF uploads.
pub struct PdfiumRasterizer;

impl PdfiumRasterizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdfiumRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn rasterize(&self, bytes: &[u8], dpi: u32) -> Result<Vec<PageImage>, EngineError> {
        let pdfium = Pdfium::new(
            Pdfium::bind_to_system_library()
                .map_err(|err| EngineError::Validation(format!("pdfium unavailable: {err}")))?,
        );

        let document = pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|err| EngineError::Validation(format!("unreadable document: {err}")))?;

        // A4 width at the requested DPI keeps handwriting legible for the
        // vision model without ballooning payload size.
        let target_width = (8.27 * dpi as f64) as i32;
        let config = PdfRenderConfig::new().set_target_width(target_width);

        let mut pages = Vec::new();
        for (index, page) in document.pages().iter().enumerate() {
            let rendered = page
                .render_with_config(&config)
                .map_err(|err| EngineError::Validation(format!("page render failed: {err}")))?;
            let dynamic = rendered.as_image();

            let mut png_bytes = Vec::new();
            dynamic
                .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
                .map_err(|err| EngineError::Validation(format!("png encode failed: {err}")))?;

            pages.push(PageImage {
                page_number: index as u32 + 1,
                png_bytes,
                mime_type: "image/png",
            });
        }

        if pages.is_empty() {
            return Err(EngineError::Validation("document has no pages".into()));
        }
        Ok(pages)
    }
}

/// Non-PDF uploads (single photographed page) pass through unmodified.
pub fn single_image_page(bytes: Vec<u8>, mime_type: &str) -> PageImage {
    let mime_type = match mime_type {
        "image/jpeg" => "image/jpeg",
        _ => "image/png",
    };
    PageImage { page_number: 1, png_bytes: bytes, mime_type }
}
