//! Screenshot → input vector.
//!
//! The PNG is decoded to 8-bit luma, correlated with a 3×3 edge-detection kernel (zero padding,
//! output the size of the input), reduced by averaging non-overlapping 4×4 blocks and flattened
//! row-major. Partial blocks at the right and bottom edges are padded with zeros and still
//! divided by 16, so the output has `ceil(H/4) * ceil(W/4)` values.

use image::GrayImage;

use crate::error::EvalError;

/// Center weight 8, every neighbor −1.
pub const KERNEL: [[f64; 3]; 3] = [[-1.0, -1.0, -1.0], [-1.0, 8.0, -1.0], [-1.0, -1.0, -1.0]];

pub const BLOCK_SIZE: usize = 4;

/// Row-major single-channel image.
#[derive(Debug, Clone, PartialEq)]
pub struct Intensity {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f64>,
}

impl Intensity {
    pub fn new(width: usize, height: usize, pixels: Vec<f64>) -> Self {
        assert_eq!(pixels.len(), width * height, "pixel count does not match size");
        Self {
            width,
            height,
            pixels,
        }
    }

    fn at(&self, x: isize, y: isize) -> f64 {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            0.0
        } else {
            self.pixels[y as usize * self.width + x as usize]
        }
    }
}

impl From<&GrayImage> for Intensity {
    fn from(img: &GrayImage) -> Self {
        let pixels = img.as_raw().iter().map(|&p| f64::from(p)).collect();
        Intensity::new(img.width() as usize, img.height() as usize, pixels)
    }
}

/// Decode `png` and run the whole pipeline.
pub fn preprocess(png: &[u8]) -> Result<Vec<f64>, EvalError> {
    let img = image::load_from_memory_with_format(png, image::ImageFormat::Png)
        .map_err(|err| EvalError::protocol(format!("invalid screenshot: {err}")))?;
    Ok(preprocess_intensity(&Intensity::from(&img.to_luma8())))
}

pub fn preprocess_intensity(img: &Intensity) -> Vec<f64> {
    block_average(&correlate(img), BLOCK_SIZE).pixels
}

/// Same-size correlation with [`KERNEL`].
pub fn correlate(img: &Intensity) -> Intensity {
    let mut out = Vec::with_capacity(img.pixels.len());
    for y in 0..img.height as isize {
        for x in 0..img.width as isize {
            let mut acc = 0.0;
            for (dy, row) in KERNEL.iter().enumerate() {
                for (dx, weight) in row.iter().enumerate() {
                    acc += weight * img.at(x + dx as isize - 1, y + dy as isize - 1);
                }
            }
            out.push(acc);
        }
    }
    Intensity::new(img.width, img.height, out)
}

/// Mean of every `block`×`block` tile, missing pixels counted as zero.
pub fn block_average(img: &Intensity, block: usize) -> Intensity {
    let width = img.width.div_ceil(block);
    let height = img.height.div_ceil(block);
    let mut sums = vec![0.0; width * height];
    for y in 0..img.height {
        for x in 0..img.width {
            sums[(y / block) * width + x / block] += img.pixels[y * img.width + x];
        }
    }
    let area = (block * block) as f64;
    Intensity::new(width, height, sums.into_iter().map(|s| s / area).collect())
}
