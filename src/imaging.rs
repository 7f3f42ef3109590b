//! Thumbnail and large image rendering through GraphicsMagick.
//!
//! Geometry is decided here; pixel work (auto-orientation, profile
//! stripping, flattening onto white, JPEG encoding) is left to `gm`.

use crate::converter::run_tool;
use crate::error::{PreviewError, Result};
use crate::geometry::{self, CropRect, LARGE_IMAGE_WIDTH, THUMBNAIL_HEIGHT, THUMBNAIL_WIDTH};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Upper bound for a single `gm` invocation.
const GM_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct ImageTool {
    gm: PathBuf,
}

impl ImageTool {
    pub fn new(gm: impl Into<PathBuf>) -> Self {
        Self { gm: gm.into() }
    }

    /// Width and height of the first frame (first page for PDFs), as it
    /// will look after `-auto-orient`.
    pub async fn identify(&self, file: &Path) -> Result<(u32, u32)> {
        let mut command = Command::new(&self.gm);
        command
            .arg("identify")
            .arg("-format")
            .arg("%w %h %[EXIF:Orientation]\n")
            .arg(first_frame(file));
        let output = run_tool(command, GM_TIMEOUT, "gm identify").await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_dimensions(&stdout).ok_or_else(|| {
            PreviewError::Conversion(format!("unexpected gm identify output: {:?}", stdout.trim()))
        })
    }

    /// Renders the fixed-size thumbnail for `source` into `output`.
    pub async fn thumbnail(&self, source: &Path, output: &Path) -> Result<()> {
        let (width, height) = self.identify(source).await?;
        let crop = geometry::thumbnail_crop(width, height, THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT);
        debug!(width, height, crop = %crop.geometry(), "Cropping thumbnail");

        self.convert(source, output, thumbnail_ops(&crop)).await
    }

    /// Renders the large preview image for `source` into `output`.
    pub async fn large_image(&self, source: &Path, output: &Path) -> Result<()> {
        let (width, _) = self.identify(source).await?;
        let target = geometry::large_image_width(width, LARGE_IMAGE_WIDTH);

        self.convert(source, output, large_image_ops(target)).await
    }

    async fn convert(&self, source: &Path, output: &Path, ops: Vec<String>) -> Result<()> {
        let mut command = Command::new(&self.gm);
        command.arg("convert").arg(first_frame(source));
        command.args(normalize_ops());
        command.args(ops);
        command.arg(output);
        run_tool(command, GM_TIMEOUT, "gm convert").await?;
        Ok(())
    }
}

/// Operations applied to every rendered output.
fn normalize_ops() -> [&'static str; 6] {
    ["-auto-orient", "+profile", "*", "-background", "white", "-flatten"]
}

fn thumbnail_ops(crop: &CropRect) -> Vec<String> {
    vec![
        "-crop".to_string(),
        crop.geometry(),
        "+repage".to_string(),
        "-resize".to_string(),
        format!("{}x{}!", THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT),
    ]
}

fn large_image_ops(width: u32) -> Vec<String> {
    vec!["-resize".to_string(), format!("{}x", width)]
}

/// `file[0]` addresses the first frame of GIFs, TIFFs and PDFs.
fn first_frame(file: &Path) -> OsString {
    let mut spec = file.as_os_str().to_os_string();
    spec.push("[0]");
    spec
}

/// Parses `<width> <height> [orientation]`. EXIF orientations 5 to 8 are
/// rotated a quarter turn, so their sides swap.
fn parse_dimensions(output: &str) -> Option<(u32, u32)> {
    let mut parts = output.lines().next()?.split_whitespace();
    let width = parts.next()?.parse().ok()?;
    let height = parts.next()?.parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    match parts.next().and_then(|o| o.parse::<u8>().ok()) {
        Some(5..=8) => Some((height, width)),
        _ => Some((width, height)),
    }
}
