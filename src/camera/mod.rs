//! Frame sources
//!
//! The pipeline does not manage camera lifecycle. It pulls the latest frame
//! through [`FrameSource::current_frame`] whenever the scheduler decides a
//! run is due.

use std::path::Path;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Camera frame data
#[derive(Clone, Debug)]
pub struct CameraFrame {
    /// RGBA pixel data
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Frame number
    pub frame_number: u64,
    /// Frame timestamp
    pub timestamp: Instant,
}

impl CameraFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, frame_number: u64) -> Self {
        Self {
            data,
            width,
            height,
            frame_number,
            timestamp: Instant::now(),
        }
    }

    /// Frame filled with one color
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Self::new(data, width, height, 0)
    }

    pub fn from_rgba_image(image: image::RgbaImage, frame_number: u64) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, frame_number)
    }

    /// Whether the buffer holds `width * height` RGBA pixels
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == (self.width as usize) * (self.height as usize) * 4
    }

    /// RGBA value at `(x, y)`; callers keep coordinates in bounds
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.width + x) * 4) as usize;
        [self.data[i], self.data[i + 1], self.data[i + 2], self.data[i + 3]]
    }
}

/// Synchronous provider of the most recent camera frame
pub trait FrameSource: Send {
    /// Latest frame, or `None` when no frame has arrived yet
    fn current_frame(&mut self) -> Option<CameraFrame>;
}

/// Returns the same image on every call
pub struct StillImageSource {
    frame: CameraFrame,
    served: u64,
}

impl StillImageSource {
    pub fn new(frame: CameraFrame) -> Self {
        Self { frame, served: 0 }
    }

    /// Decode an image file into a still source
    pub fn open(path: &Path) -> image::ImageResult<Self> {
        let image = image::open(path)?.to_rgba8();
        Ok(Self::new(CameraFrame::from_rgba_image(image, 0)))
    }
}

impl FrameSource for StillImageSource {
    fn current_frame(&mut self) -> Option<CameraFrame> {
        let mut frame = self.frame.clone();
        frame.frame_number = self.served;
        frame.timestamp = Instant::now();
        self.served += 1;
        Some(frame)
    }
}

/// Procedural frames: a bright wall patch drifting over a dark noisy room
pub struct SyntheticFrameSource {
    width: u32,
    height: u32,
    frame_number: u64,
    noise: u8,
    rng: StdRng,
}

impl SyntheticFrameSource {
    pub fn new(width: u32, height: u32, seed: u64) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frame_number: 0,
            noise: 24,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Per-channel noise amplitude
    pub fn with_noise(mut self, noise: u8) -> Self {
        self.noise = noise;
        self
    }

    fn render(&mut self) -> CameraFrame {
        let (w, h) = (self.width, self.height);
        // Patch covers half the frame and slides one pixel per frame.
        let patch_w = (w / 2).max(1);
        let offset = (self.frame_number % u64::from(w)) as u32;
        let top = h / 5;
        let bottom = h - h / 5;

        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                let in_patch = ((x + w - offset) % w) < patch_w && y >= top && y < bottom;
                let base: i16 = if in_patch { 220 } else { 40 };
                let jitter = if self.noise > 0 {
                    let n = i16::from(self.noise);
                    self.rng.random_range(-n..=n)
                } else {
                    0
                };
                let v = (base + jitter).clamp(0, 255) as u8;
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }

        let frame = CameraFrame::new(data, w, h, self.frame_number);
        self.frame_number += 1;
        frame
    }
}

impl FrameSource for SyntheticFrameSource {
    fn current_frame(&mut self) -> Option<CameraFrame> {
        Some(self.render())
    }
}
