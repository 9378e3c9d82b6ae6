//! Image artifacts
//!
//! Conversion of sample tensors to RGB chunks and background PNG writing.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use burn::prelude::*;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{debug, warn};

use crate::results::ImageChunk;

/// Widest tile in the progress sprite
const SPRITE_TILE_WIDTH: u32 = 256;

/// Convert `[n, 3, h, w]` in `[-1, 1]` to interleaved RGB per batch element
pub fn tensor_to_rgb<B: Backend>(image: Tensor<B, 4>) -> Vec<Vec<u8>> {
    let [n, _, h, w] = image.dims();
    let image = ((image + 1.0) * 127.5).clamp(0.0, 255.0);
    let floats: Vec<f32> = image.into_data().iter::<f32>().collect();

    let plane = h * w;
    (0..n)
        .map(|b| {
            let base = b * 3 * plane;
            let mut rgb = Vec::with_capacity(plane * 3);
            for y in 0..h {
                for x in 0..w {
                    for c in 0..3 {
                        let idx = base + c * plane + y * w + x;
                        rgb.push(floats[idx].round() as u8);
                    }
                }
            }
            rgb
        })
        .collect()
}

/// One chunk per batch element of `image`
pub fn image_chunks<B: Backend>(
    image: Tensor<B, 4>,
    step: usize,
    cur_t: i64,
    loss: Option<f64>,
) -> Vec<ImageChunk> {
    let [_, _, height, width] = image.dims();
    tensor_to_rgb(image)
        .into_iter()
        .enumerate()
        .map(|(minibatch_idx, rgb)| ImageChunk {
            step,
            cur_t,
            loss,
            minibatch_idx,
            width,
            height,
            rgb,
        })
        .collect()
}

/// Load an RGB image resized to `width x height` as `[1, 3, h, w]` in `[-1, 1]`
pub fn load_image<B: Backend>(
    path: &Path,
    width: usize,
    height: usize,
    device: &B::Device,
) -> Result<Tensor<B, 4>, image::ImageError> {
    let rgb = image::open(path)?.to_rgb8();
    let rgb = imageops::resize(&rgb, width as u32, height as u32, FilterType::Lanczos3);

    let plane = width * height;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * width + x as usize;
        for c in 0..3 {
            data[c * plane + idx] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }
    Ok(Tensor::from_data(
        TensorData::new(data, [1, 3, height, width]),
        device,
    ))
}

fn chunk_image(chunk: &ImageChunk) -> Option<RgbImage> {
    RgbImage::from_raw(chunk.width as u32, chunk.height as u32, chunk.rgb.clone())
}

/// Tile chunks into a grid, one row per saved step, one column per batch element
fn compose_sprite(tiles: &[ImageChunk]) -> Option<RgbImage> {
    let first = tiles.first()?;
    let columns = tiles.iter().map(|t| t.minibatch_idx + 1).max()? as u32;
    let mut steps: Vec<usize> = tiles.iter().map(|t| t.step).collect();
    steps.dedup();
    let rows = steps.len() as u32;

    let scale = (SPRITE_TILE_WIDTH as f64 / first.width as f64).min(1.0);
    let tile_w = ((first.width as f64 * scale) as u32).max(1);
    let tile_h = ((first.height as f64 * scale) as u32).max(1);

    let mut sprite = RgbImage::new(tile_w * columns, tile_h * rows);
    for tile in tiles {
        let Some(row) = steps.iter().position(|s| *s == tile.step) else {
            continue;
        };
        let Some(image) = chunk_image(tile) else {
            continue;
        };
        let image = imageops::resize(&image, tile_w, tile_h, FilterType::Triangle);
        imageops::replace(
            &mut sprite,
            &image,
            (tile.minibatch_idx as u32 * tile_w) as i64,
            (row as u32 * tile_h) as i64,
        );
    }
    Some(sprite)
}

/// Writes the PNG files of one batch on a background thread
pub struct ArtifactWriter {
    dir: PathBuf,
    prefix: String,
    tiles: Vec<ImageChunk>,
    pending: Option<JoinHandle<()>>,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.into(),
            tiles: Vec::new(),
            pending: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write previews of `chunks` and refresh the progress sprite
    ///
    /// Waits for the previous write so at most one is in flight.
    pub fn save(&mut self, chunks: &[ImageChunk], done: bool) {
        self.join();
        self.tiles.extend_from_slice(chunks);

        let files: Vec<(PathBuf, ImageChunk)> = chunks
            .iter()
            .map(|chunk| {
                let name = if done {
                    format!("{}-done-{}.png", self.prefix, chunk.minibatch_idx)
                } else {
                    format!(
                        "{}-step-{}-{}.png",
                        self.prefix, chunk.step, chunk.minibatch_idx
                    )
                };
                (self.dir.join(name), chunk.clone())
            })
            .collect();
        let tiles = self.tiles.clone();
        let sprite_path = self.dir.join(format!("{}-progress.png", self.prefix));

        self.pending = Some(thread::spawn(move || {
            for (path, chunk) in files {
                match chunk_image(&chunk) {
                    Some(image) => {
                        if let Err(e) = image.save(&path) {
                            warn!("failed to write {}: {}", path.display(), e);
                        }
                    }
                    None => warn!("chunk size mismatch for {}", path.display()),
                }
            }
            if let Some(sprite) = compose_sprite(&tiles) {
                if let Err(e) = sprite.save(&sprite_path) {
                    warn!("failed to write {}: {}", sprite_path.display(), e);
                }
            }
            debug!("wrote artifacts to {}", sprite_path.display());
        }));
    }

    /// Wait for the write in flight
    pub fn join(&mut self) {
        if let Some(handle) = self.pending.take() {
            if handle.join().is_err() {
                warn!("artifact writer panicked");
            }
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_tensor_to_rgb() {
        let data = vec![
            -1.0, 1.0, // r
            0.0, 0.0, // g
            1.0, -1.0, // b
        ];
        let image = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(data, [1, 3, 1, 2]),
            &Default::default(),
        );
        let rgb = tensor_to_rgb(image);
        assert_eq!(rgb.len(), 1);
        assert_eq!(rgb[0], vec![0, 128, 255, 255, 128, 0]);
    }

    #[test]
    fn test_writer_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let image = Tensor::<TestBackend, 4>::zeros([2, 3, 4, 6], &Default::default());
        let mut writer = ArtifactWriter::new(dir.path(), "0").unwrap();

        writer.save(&image_chunks(image.clone(), 0, 4, Some(1.0)), false);
        writer.save(&image_chunks(image, 4, -1, None), true);
        writer.join();

        for name in ["0-step-0-0.png", "0-step-0-1.png", "0-done-0.png", "0-done-1.png"] {
            assert!(dir.path().join(name).exists(), "{}", name);
        }
        let sprite = image::open(dir.path().join("0-progress.png"))
            .unwrap()
            .to_rgb8();
        assert_eq!(sprite.dimensions(), (12, 8));
    }

    #[test]
    fn test_load_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("init.png");
        RgbImage::from_pixel(4, 2, image::Rgb([255, 0, 255]))
            .save(&path)
            .unwrap();

        let tensor = load_image::<TestBackend>(&path, 4, 2, &Default::default()).unwrap();
        assert_eq!(tensor.dims(), [1, 3, 2, 4]);
        let values: Vec<f32> = tensor.into_data().to_vec().unwrap();
        assert!((values[0] - 1.0).abs() < 1e-2);
        assert!((values[8] + 1.0).abs() < 1e-2);
    }
}
