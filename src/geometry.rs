//! Crop and resize geometry for thumbnails and large images.
//!
//! Thumbnails cut the largest region with the thumbnail's aspect ratio out of
//! the source and scale it down to the fixed box. Landscape sources keep the
//! horizontal centre and lean towards the top; everything else (portrait
//! pages, squares) is cut from the top-left corner, where documents carry
//! their title and headline.

/// Fixed thumbnail box.
pub const THUMBNAIL_WIDTH: u32 = 300;
pub const THUMBNAIL_HEIGHT: u32 = 300;

/// Target width of the large preview image.
pub const LARGE_IMAGE_WIDTH: u32 = 1038;

/// Rectangle to cut out of the source image, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// GraphicsMagick geometry string (`WxH+X+Y`).
    pub fn geometry(&self) -> String {
        format!("{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Computes the region of a `width` x `height` source that becomes a
/// `box_width` x `box_height` thumbnail.
pub fn thumbnail_crop(width: u32, height: u32, box_width: u32, box_height: u32) -> CropRect {
    let width_ratio = f64::from(width) / f64::from(box_width);
    let height_ratio = f64::from(height) / f64::from(box_height);
    let ratio = width_ratio.min(height_ratio);

    let crop_width = (f64::from(box_width) * ratio).floor() as u32;
    let crop_height = (f64::from(box_height) * ratio).floor() as u32;

    let (x, y) = if width > height {
        (
            width.saturating_sub(crop_width) / 2,
            height.saturating_sub(crop_height) / 3,
        )
    } else {
        (0, 0)
    };

    CropRect {
        x,
        y,
        width: crop_width,
        height: crop_height,
    }
}

/// Width of the large preview image. Sources are never upscaled.
pub fn large_image_width(width: u32, target_width: u32) -> u32 {
    width.min(target_width)
}
