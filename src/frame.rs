// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - NCHW 归一化缓冲区
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

/// 一个批次的归一化像素数据，按 N×C×H×W 排列
#[derive(Debug, Clone, Default)]
pub struct NormalizedBuffer {
  data: Vec<f32>,
  batch: usize,
  channels: usize,
  height: usize,
  width: usize,
}

impl NormalizedBuffer {
  pub fn with_shape(batch: usize, channels: usize, height: usize, width: usize) -> Self {
    Self::reuse(Vec::new(), batch, channels, height, width)
  }

  /// 复用已有的存储，长度调整为新形状并清零
  pub fn reuse(
    mut data: Vec<f32>,
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
  ) -> Self {
    data.clear();
    data.resize(batch * channels * height * width, 0.0);
    Self {
      data,
      batch,
      channels,
      height,
      width,
    }
  }

  pub fn batch(&self) -> usize {
    self.batch
  }

  pub fn channels(&self) -> usize {
    self.channels
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  /// [batch, C, H, W]
  pub fn shape(&self) -> [usize; 4] {
    [self.batch, self.channels, self.height, self.width]
  }

  pub fn image_len(&self) -> usize {
    self.channels * self.height * self.width
  }

  pub fn image(&self, index: usize) -> Option<&[f32]> {
    let len = self.image_len();
    self.data.get(index * len..(index + 1) * len)
  }

  /// 按图像切分的可变区域，互不重叠
  pub fn images_mut(&mut self) -> std::slice::ChunksExactMut<'_, f32> {
    let len = self.image_len().max(1);
    self.data.chunks_exact_mut(len)
  }

  pub fn into_vec(self) -> Vec<f32> {
    self.data
  }
}

impl AsRef<[f32]> for NormalizedBuffer {
  fn as_ref(&self) -> &[f32] {
    &self.data
  }
}

impl AsMut<[f32]> for NormalizedBuffer {
  fn as_mut(&mut self) -> &mut [f32] {
    &mut self.data
  }
}
