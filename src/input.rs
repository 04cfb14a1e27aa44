// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 单张图像预处理
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  io::Cursor,
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
};

use image::{
  DynamicImage, GenericImageView, ImageBuffer, ImageReader, Pixel,
  imageops::{self, FilterType},
};
use tracing::debug;

use crate::{
  config::{ChannelOrder, ModelDescriptor, TaskKind},
  error::PipelineError,
  geometry::{self, Geometry, GeometryMetadata},
};

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// 已读入内存、只解析过文件头的图像
#[derive(Debug, Clone)]
pub struct ImageFile {
  pub path: PathBuf,
  pub bytes: Vec<u8>,
  pub width: u32,
  pub height: u32,
}

impl ImageFile {
  fn reader(&self) -> Result<ImageReader<Cursor<&[u8]>>, PipelineError> {
    ImageReader::new(Cursor::new(self.bytes.as_slice()))
      .with_guessed_format()
      .map_err(|e| PipelineError::decode_failed(&self.path, e))
  }

  pub fn decode(&self) -> Result<DynamicImage, PipelineError> {
    self
      .reader()?
      .decode()
      .map_err(|e| PipelineError::decode_failed(&self.path, e))
  }
}

/// 读入整个文件并解析文件头；文件 I/O 只发生在这里
pub fn read(path: &Path) -> Result<ImageFile, PipelineError> {
  let bytes = std::fs::read(path).map_err(|e| PipelineError::decode_failed(path, e))?;
  let mut file = ImageFile {
    path: path.to_path_buf(),
    bytes,
    width: 0,
    height: 0,
  };
  let (width, height) = file
    .reader()?
    .into_dimensions()
    .map_err(|e| PipelineError::decode_failed(path, e))?;
  if width == 0 || height == 0 {
    return Err(PipelineError::decode_failed(path, "空图像"));
  }
  file.width = width;
  file.height = height;
  Ok(file)
}

/// 展开输入路径：目录按文件名排序展开为其中的图像文件
pub fn collect_images<P: AsRef<Path>>(inputs: &[P]) -> Result<Vec<PathBuf>, PipelineError> {
  let mut images = Vec::new();
  for input in inputs {
    let input = input.as_ref();
    if input.is_dir() {
      let mut entries = std::fs::read_dir(input)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
          path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false)
        })
        .collect::<Vec<_>>();
      entries.sort();
      debug!("目录 {} 中找到 {} 张图像", input.display(), entries.len());
      images.extend(entries);
    } else {
      images.push(input.to_path_buf());
    }
  }
  Ok(images)
}

/// 单张图像预处理器：解码、缩放/裁剪、归一化为通道平面布局
#[derive(Debug, Clone)]
pub struct Preprocessor {
  descriptor: Arc<ModelDescriptor>,
}

impl Preprocessor {
  pub fn new(descriptor: Arc<ModelDescriptor>) -> Self {
    Self { descriptor }
  }

  pub fn descriptor(&self) -> &ModelDescriptor {
    &self.descriptor
  }

  pub fn plan(&self, width: u32, height: u32) -> Geometry {
    geometry::plan(width, height, &self.descriptor.resize)
  }

  /// 单张图像输出的元素个数
  pub fn output_len(&self, geometry: &Geometry) -> usize {
    let (w, h) = geometry.tensor_size();
    self.descriptor.channels * w as usize * h as usize
  }

  /// 3 输入检测模型在缩放前先转换为 0..1 浮点
  fn scale_before_resize(&self) -> bool {
    self.descriptor.task() == TaskKind::Detection && self.descriptor.feeds_size == 3
  }

  pub fn process(&self, path: &Path) -> Result<(Vec<f32>, GeometryMetadata), PipelineError> {
    let file = read(path).inspect_err(|e| debug!("无法读取图像: {}", e))?;
    let geometry = self.plan(file.width, file.height);
    let mut data = vec![0.0f32; self.output_len(&geometry)];
    let meta = self.process_into(&file, &geometry, &mut data, &AtomicBool::new(false))?;
    Ok((data, meta))
  }

  /// 解码并写入 `out`，`geometry` 由文件头尺寸规划；解码前后检查取消标志
  pub fn process_into(
    &self,
    file: &ImageFile,
    geometry: &Geometry,
    out: &mut [f32],
    cancel: &AtomicBool,
  ) -> Result<GeometryMetadata, PipelineError> {
    if cancel.load(Ordering::Relaxed) {
      return Err(PipelineError::Cancelled);
    }
    let image = file
      .decode()
      .inspect_err(|e| debug!("无法解码图像: {}", e))?;
    if cancel.load(Ordering::Relaxed) {
      return Err(PipelineError::Cancelled);
    }

    let (width, height) = image.dimensions();
    if (width, height) != (file.width, file.height) {
      return Err(PipelineError::decode_failed(
        &file.path,
        format!(
          "解码尺寸 {}x{} 与文件头 {}x{} 不一致",
          width, height, file.width, file.height
        ),
      ));
    }
    self.process_image(&image, geometry, out)
  }

  /// 对已解码图像执行缩放与归一化，写入 `out`
  pub fn process_image(
    &self,
    image: &DynamicImage,
    geometry: &Geometry,
    out: &mut [f32],
  ) -> Result<GeometryMetadata, PipelineError> {
    let (width, height) = image.dimensions();
    let expected = self.output_len(geometry);
    if out.len() != expected {
      return Err(PipelineError::shape(format!(
        "预处理缓冲区长度为 {}, 期望 {}",
        out.len(),
        expected
      )));
    }

    let d = &self.descriptor;
    let from_u8 = |v: u8| v as f32 / 255.0;
    let from_f32 = |v: f32| v;
    match (d.channels, self.scale_before_resize()) {
      (3, false) => {
        let image = fit(image.to_rgb8(), geometry);
        write_planar(&image, from_u8, &d.mean, &d.std, d.channel_order, out);
      }
      (3, true) => {
        let image = fit(image.to_rgb32f(), geometry);
        write_planar(&image, from_f32, &d.mean, &d.std, d.channel_order, out);
      }
      (_, false) => {
        let image = fit(image.to_luma8(), geometry);
        write_planar(&image, from_u8, &d.mean, &d.std, d.channel_order, out);
      }
      (_, true) => {
        let image = fit(image.to_luma32f(), geometry);
        write_planar(&image, from_f32, &d.mean, &d.std, d.channel_order, out);
      }
    }

    Ok(GeometryMetadata::new(width, height, geometry))
  }
}

/// 按规划结果进行双线性缩放与中心裁剪
fn fit<P>(image: ImageBuffer<P, Vec<P::Subpixel>>, geometry: &Geometry) -> ImageBuffer<P, Vec<P::Subpixel>>
where
  P: Pixel + 'static,
  P::Subpixel: 'static,
{
  let (width, height) = image.dimensions();
  let image = if geometry.needs_resize(width, height) {
    imageops::resize(
      &image,
      geometry.resized_width,
      geometry.resized_height,
      FilterType::Triangle,
    )
  } else {
    image
  };

  match geometry.crop {
    Some((crop_w, crop_h)) => {
      let x = image.width().saturating_sub(crop_w) / 2;
      let y = image.height().saturating_sub(crop_h) / 2;
      imageops::crop_imm(&image, x, y, crop_w, crop_h).to_image()
    }
    None => image,
  }
}

/// (value - mean[c]) / std[c]，写入 C×H×W 布局
fn write_planar<P>(
  image: &ImageBuffer<P, Vec<P::Subpixel>>,
  unit: impl Fn(P::Subpixel) -> f32,
  mean: &[f32],
  std: &[f32],
  order: ChannelOrder,
  out: &mut [f32],
) where
  P: Pixel,
{
  let channels = mean.len();
  let (width, height) = (image.width() as usize, image.height() as usize);
  for (x, y, pixel) in image.enumerate_pixels() {
    let values = pixel.channels();
    for c in 0..channels {
      let src = match order {
        ChannelOrder::Bgr if channels == 3 => channels - 1 - c,
        _ => c,
      };
      let index = (c * height + y as usize) * width + x as usize;
      out[index] = (unit(values[src]) - mean[c]) / std[c];
    }
  }
}
