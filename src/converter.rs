//! Source format conversions ahead of rendering.
//!
//! Office documents are turned into PDF by headless LibreOffice. SVG sources
//! are rasterised in-process with resvg, so the image tool never has to
//! guess at vector delegates.

use crate::error::{PreviewError, Result};
use resvg::tiny_skia;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

/// Runs an external tool to completion, killing it when `timeout` expires.
pub(crate) async fn run_tool(mut command: Command, timeout: Duration, tool: &str) -> Result<Output> {
    command.kill_on_drop(true);
    debug!(tool, command = ?command, "Running external tool");

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| PreviewError::Timeout(timeout))?
        .map_err(|e| PreviewError::Conversion(format!("unable to run {}: {}", tool, e)))?;

    if !output.status.success() {
        return Err(PreviewError::Conversion(format!(
            "{} exited with {}: {}",
            tool,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(output)
}

/// Office-to-PDF converter backed by `soffice --headless`.
#[derive(Debug, Clone)]
pub struct OfficeConverter {
    soffice: PathBuf,
    timeout: Duration,
}

impl OfficeConverter {
    pub fn new(soffice: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            soffice: soffice.into(),
            timeout,
        }
    }

    /// Converts `source` into `<outdir>/<source stem>.pdf` and returns that path.
    ///
    /// # Errors
    ///
    /// - `Timeout` when LibreOffice runs longer than the converter timeout
    /// - `Conversion` when it fails or does not produce the PDF
    pub async fn to_pdf(&self, source: &Path, outdir: &Path) -> Result<PathBuf> {
        info!(source = %source.display(), "Converting office document to PDF");

        let mut command = Command::new(&self.soffice);
        // soffice will not start while another instance holds the profile lock.
        if let Ok(profile) = Url::from_directory_path(outdir.join(".soffice-profile")) {
            command.arg(format!("-env:UserInstallation={}", profile));
        }
        command
            .arg("--headless")
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(outdir)
            .arg(source);
        run_tool(command, self.timeout, "soffice").await?;

        let pdf_path = pdf_output_path(source, outdir);
        if !pdf_path.exists() {
            return Err(PreviewError::Conversion(
                "a PDF file could not be generated".to_string(),
            ));
        }
        Ok(pdf_path)
    }
}

/// Where LibreOffice writes the PDF for `source`.
fn pdf_output_path(source: &Path, outdir: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "source".into());
    let mut file_name = stem;
    file_name.push(".pdf");
    outdir.join(file_name)
}

/// Renders an SVG file to a PNG at its intrinsic size.
///
/// # Errors
///
/// - SVG parsing errors (malformed XML, unsupported features)
/// - Invalid or unrenderable dimensions
/// - File I/O errors
pub fn rasterize_svg(source: &Path, output: &Path) -> Result<()> {
    let data = std::fs::read(source)?;

    let tree = usvg::Tree::from_data(&data, &usvg::Options::default())
        .map_err(|e| PreviewError::Conversion(format!("failed to parse SVG: {}", e)))?;

    let size = tree.size();
    if size.width() <= 0.0 || size.height() <= 0.0 {
        return Err(PreviewError::Conversion(format!(
            "invalid SVG dimensions: {}x{}",
            size.width(),
            size.height()
        )));
    }

    let size = size.to_int_size();
    let mut pixmap = tiny_skia::Pixmap::new(size.width(), size.height()).ok_or_else(|| {
        PreviewError::Conversion(format!(
            "cannot allocate a {}x{} canvas",
            size.width(),
            size.height()
        ))
    })?;
    resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());

    pixmap
        .save_png(output)
        .map_err(|e| PreviewError::Conversion(format!("failed to write PNG: {}", e)))?;

    debug!(
        width = size.width(),
        height = size.height(),
        output = %output.display(),
        "SVG rasterised"
    );
    Ok(())
}
