//! V4L2 camera capture behind a narrow trait.
//!
//! The pipeline only needs "give me the next frame", so everything else —
//! device negotiation, pixel formats, buffer management — stays in here,
//! and tests drive the pipeline with synthetic sources instead.

use image::{GrayImage, RgbImage};
use thiserror::Error;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use gaze_core::frame::{luma_of, Frame};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open camera {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to negotiate camera format: {0}")]
    Format(std::io::Error),
    #[error("camera delivers unsupported pixel format {0}")]
    Unsupported(String),
    #[error("frame capture failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("camera delivered a malformed buffer ({0} bytes)")]
    ShortBuffer(usize),
}

/// A source of camera frames. One exclusive handle per attempt.
pub trait FrameSource: Send {
    fn dimensions(&self) -> (u32, u32);
    fn grab(&mut self) -> Result<Frame, CaptureError>;
}

/// Memory-mapped V4L2 capture. Prefers YUYV and accepts GREY.
pub struct V4l2Source {
    stream: Stream<'static>,
    width: u32,
    height: u32,
    fourcc: [u8; 4],
    sequence: u64,
}

impl V4l2Source {
    pub fn open(device: &str) -> Result<Self, CaptureError> {
        let dev = Device::with_path(device).map_err(|source| CaptureError::Open {
            device: device.to_string(),
            source,
        })?;

        let mut fmt = dev.format().map_err(CaptureError::Format)?;
        fmt.fourcc = FourCC::new(b"YUYV");
        let fmt = dev.set_format(&fmt).map_err(CaptureError::Format)?;
        let fourcc = fmt.fourcc.repr;
        if &fourcc != b"YUYV" && &fourcc != b"GREY" {
            return Err(CaptureError::Unsupported(
                String::from_utf8_lossy(&fourcc).into_owned(),
            ));
        }
        tracing::info!(
            device,
            width = fmt.width,
            height = fmt.height,
            fourcc = %String::from_utf8_lossy(&fourcc),
            "camera opened"
        );

        // The mmap stream borrows the device handle. The verifier is one
        // attempt per process and holds exactly one camera for its whole
        // lifetime, so the handle is given a process lifetime here.
        let dev: &'static mut Device = Box::leak(Box::new(dev));
        let stream =
            Stream::with_buffers(dev, Type::VideoCapture, 4).map_err(CaptureError::Io)?;

        Ok(Self {
            stream,
            width: fmt.width,
            height: fmt.height,
            fourcc,
            sequence: 0,
        })
    }
}

impl FrameSource for V4l2Source {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn grab(&mut self) -> Result<Frame, CaptureError> {
        let sequence = self.sequence + 1;
        let (width, height, fourcc) = (self.width, self.height, self.fourcc);
        let (data, _meta) = CaptureStream::next(&mut self.stream)?;
        let frame = match &fourcc {
            b"YUYV" => yuyv_frame(data, width, height, sequence)?,
            _ => grey_frame(data, width, height, sequence)?,
        };
        self.sequence = sequence;
        Ok(frame)
    }
}

/// Decode a packed YUYV 4:2:2 buffer into an RGB image plus the luma
/// channel taken directly from the Y samples.
fn yuyv_frame(data: &[u8], width: u32, height: u32, sequence: u64) -> Result<Frame, CaptureError> {
    let needed = (width as usize) * (height as usize) * 2;
    if data.len() < needed {
        return Err(CaptureError::ShortBuffer(data.len()));
    }

    let mut rgb = RgbImage::new(width, height);
    let mut luma = GrayImage::new(width, height);
    for y in 0..height as usize {
        let row = &data[y * width as usize * 2..];
        for pair in 0..(width as usize) / 2 {
            let chunk = &row[pair * 4..pair * 4 + 4];
            let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
            let x = (pair * 2) as u32;
            rgb.put_pixel(x, y as u32, image::Rgb(ycbcr_to_rgb(y0, u, v)));
            rgb.put_pixel(x + 1, y as u32, image::Rgb(ycbcr_to_rgb(y1, u, v)));
            luma.put_pixel(x, y as u32, image::Luma([y0]));
            luma.put_pixel(x + 1, y as u32, image::Luma([y1]));
        }
    }
    Ok(Frame::from_parts(rgb, luma, sequence))
}

/// GREY cameras (IR sensors) deliver the luma plane directly; the color
/// image is a replication so downstream crops stay three-channel.
fn grey_frame(data: &[u8], width: u32, height: u32, sequence: u64) -> Result<Frame, CaptureError> {
    let needed = (width as usize) * (height as usize);
    if data.len() < needed {
        return Err(CaptureError::ShortBuffer(data.len()));
    }
    let luma = GrayImage::from_raw(width, height, data[..needed].to_vec())
        .ok_or(CaptureError::ShortBuffer(data.len()))?;
    let rgb = RgbImage::from_fn(width, height, |x, y| {
        let v = luma.get_pixel(x, y)[0];
        image::Rgb([v, v, v])
    });
    Ok(Frame::from_parts(rgb, luma, sequence))
}

/// BT.601 integer conversion, the same math V4L2 consumers conventionally
/// use for webcam YUYV output.
fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(cb) - 128;
    let e = i32::from(cr) - 128;
    let clamp = |v: i32| ((v + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}
