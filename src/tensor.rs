// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 输入张量组装
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

use tracing::debug;

use crate::{
  config::{ModelDescriptor, TaskKind},
  error::PipelineError,
  frame::NormalizedBuffer,
  geometry::GeometryMetadata,
};

/// 输入张量在模型中的用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedRole {
  /// 图像张量 [batch, C, H, W]
  Image,
  /// 缩放信息 [batch, 3]：缩放后高、宽、缩放比例
  Info,
  /// 原始尺寸 [batch, 2] 或 [batch, 3]
  ImSize,
}

impl FeedRole {
  /// 旧式执行模式下使用的固定名称
  pub fn legacy_name(&self) -> &'static str {
    match self {
      FeedRole::Image => "image",
      FeedRole::Info => "info",
      FeedRole::ImSize => "im_size",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
  Float32,
  Int32,
}

#[derive(Debug, Clone, Copy)]
pub enum TensorData<'a> {
  F32(&'a [f32]),
  I32(&'a [i32]),
}

impl TensorData<'_> {
  pub fn dtype(&self) -> DType {
    match self {
      TensorData::F32(_) => DType::Float32,
      TensorData::I32(_) => DType::Int32,
    }
  }

  pub fn len(&self) -> usize {
    match self {
      TensorData::F32(data) => data.len(),
      TensorData::I32(data) => data.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// 交给推理引擎的带名称、形状与类型的输入张量视图
#[derive(Debug, Clone)]
pub struct FeedTensor<'a> {
  pub name: &'a str,
  pub role: FeedRole,
  pub shape: Vec<usize>,
  pub data: TensorData<'a>,
}

impl FeedTensor<'_> {
  pub fn dtype(&self) -> DType {
    self.data.dtype()
  }
}

#[derive(Debug, Clone)]
enum SizeFeed {
  Int(Vec<i32>),
  Float(Vec<f32>),
}

/// 一个批次组装好的输入数据，张量视图借用其中的存储
#[derive(Debug)]
pub struct FeedSet<'b> {
  batch: usize,
  image: &'b [f32],
  image_shape: [usize; 4],
  info: Option<Vec<f32>>,
  im_size: Option<SizeFeed>,
}

impl<'b> FeedSet<'b> {
  pub fn batch(&self) -> usize {
    self.batch
  }

  pub fn image_shape(&self) -> [usize; 4] {
    self.image_shape
  }

  /// 按角色顺序生成张量视图，`names` 与 [`TensorMarshaler::roles`] 一一对应
  pub fn tensors<'s>(&'s self, roles: &[FeedRole], names: &'s [String]) -> Vec<FeedTensor<'s>> {
    let mut tensors = Vec::with_capacity(roles.len());
    for (role, name) in roles.iter().zip(names) {
      let (shape, data) = match role {
        FeedRole::Image => (self.image_shape.to_vec(), TensorData::F32(self.image)),
        FeedRole::Info => match &self.info {
          Some(info) => (vec![self.batch, 3], TensorData::F32(info)),
          None => continue,
        },
        FeedRole::ImSize => match &self.im_size {
          Some(SizeFeed::Int(size)) => (vec![self.batch, 2], TensorData::I32(size)),
          Some(SizeFeed::Float(size)) => (vec![self.batch, 3], TensorData::F32(size)),
          None => continue,
        },
      };
      tensors.push(FeedTensor {
        name: name.as_str(),
        role: *role,
        shape,
        data,
      });
    }
    tensors
  }
}

/// 根据模型声明的输入个数组装输入张量
#[derive(Debug, Clone)]
pub struct TensorMarshaler {
  task: TaskKind,
  feeds_size: usize,
  roles: Vec<FeedRole>,
}

impl TensorMarshaler {
  pub fn new(descriptor: &ModelDescriptor) -> Self {
    let task = descriptor.task();
    let roles = match (task, descriptor.feeds_size) {
      (TaskKind::Classification, _) => vec![FeedRole::Image],
      (TaskKind::Detection, 3) => vec![FeedRole::Image, FeedRole::Info, FeedRole::ImSize],
      (TaskKind::Detection, _) => vec![FeedRole::Image, FeedRole::ImSize],
    };
    Self {
      task,
      feeds_size: descriptor.feeds_size,
      roles,
    }
  }

  /// 输入张量的角色及顺序
  pub fn roles(&self) -> &[FeedRole] {
    &self.roles
  }

  pub fn marshal<'b>(
    &self,
    buffer: &'b NormalizedBuffer,
    geometry: &[GeometryMetadata],
  ) -> Result<FeedSet<'b>, PipelineError> {
    let batch = buffer.batch();
    if geometry.len() != batch {
      return Err(PipelineError::shape(format!(
        "几何信息个数 {} 与批大小 {} 不一致",
        geometry.len(),
        batch
      )));
    }

    let image_shape = match self.task {
      TaskKind::Classification => buffer.shape(),
      TaskKind::Detection => {
        let first = geometry
          .first()
          .ok_or_else(|| PipelineError::shape("空批次"))?;
        [
          batch,
          buffer.channels(),
          first.resized_height as usize,
          first.resized_width as usize,
        ]
      }
    };
    let expected: usize = image_shape.iter().product();
    if expected != buffer.as_ref().len() {
      return Err(PipelineError::shape(format!(
        "图像张量形状 {:?} 需要 {} 个元素, 缓冲区有 {} 个",
        image_shape,
        expected,
        buffer.as_ref().len()
      )));
    }

    let (info, im_size) = match (self.task, self.feeds_size) {
      (TaskKind::Classification, _) => (None, None),
      (TaskKind::Detection, 3) => {
        let info: Vec<f32> = geometry
          .iter()
          .flat_map(|g| [g.resized_height as f32, g.resized_width as f32, g.scale_ratio])
          .collect();
        let size: Vec<f32> = geometry
          .iter()
          .flat_map(|g| [g.original_height as f32, g.original_width as f32, 1.0])
          .collect();
        (Some(info), Some(SizeFeed::Float(size)))
      }
      (TaskKind::Detection, _) => {
        let size: Vec<i32> = geometry
          .iter()
          .flat_map(|g| [g.original_height as i32, g.original_width as i32])
          .collect();
        (None, Some(SizeFeed::Int(size)))
      }
    };

    debug!("输入张量: image {:?}, 输入个数 {}", image_shape, self.roles.len());
    Ok(FeedSet {
      batch,
      image: buffer.as_ref(),
      image_shape,
      info,
      im_size,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::geometry::ResizePolicy;

  fn descriptor(resize: ResizePolicy, feeds_size: usize) -> ModelDescriptor {
    let text = format!(
      r#"{{ "batch_size": 2, "mean": [0, 0, 0], "std": [1, 1, 1], "feeds_size": {}, "resize": {} }}"#,
      feeds_size,
      serde_json::to_string(&resize).unwrap()
    );
    ModelDescriptor::from_json_str(&text).unwrap()
  }

  fn meta(ow: u32, oh: u32, rw: u32, rh: u32, ratio: f32) -> GeometryMetadata {
    GeometryMetadata {
      original_width: ow,
      original_height: oh,
      resized_width: rw,
      resized_height: rh,
      scale_ratio: ratio,
    }
  }

  fn names(roles: &[FeedRole]) -> Vec<String> {
    roles.iter().map(|r| r.legacy_name().to_string()).collect()
  }

  #[test]
  fn classification_has_single_image_feed() {
    let d = descriptor(
      ResizePolicy::FixedCrop {
        crop_short_size: 4,
        width: 2,
        height: 2,
      },
      1,
    );
    let marshaler = TensorMarshaler::new(&d);
    let buffer = NormalizedBuffer::with_shape(2, 3, 2, 2);
    let geometry = [meta(8, 8, 4, 4, 1.0); 2];
    let feeds = marshaler.marshal(&buffer, &geometry).unwrap();
    let names = names(marshaler.roles());
    let tensors = feeds.tensors(marshaler.roles(), &names);
    assert_eq!(tensors.len(), 1);
    assert_eq!(tensors[0].name, "image");
    assert_eq!(tensors[0].shape, vec![2, 3, 2, 2]);
    assert_eq!(tensors[0].dtype(), DType::Float32);
  }

  #[test]
  fn two_feed_detection_uses_int_sizes() {
    let d = descriptor(
      ResizePolicy::Unpadded {
        width: 4,
        height: 2,
      },
      2,
    );
    let marshaler = TensorMarshaler::new(&d);
    let buffer = NormalizedBuffer::with_shape(2, 3, 2, 4);
    let geometry = [meta(640, 480, 4, 2, 1.0), meta(320, 200, 4, 2, 1.0)];
    let feeds = marshaler.marshal(&buffer, &geometry).unwrap();
    let names = names(marshaler.roles());
    let tensors = feeds.tensors(marshaler.roles(), &names);
    assert_eq!(tensors.len(), 2);
    assert_eq!(tensors[0].shape, vec![2, 3, 2, 4]);
    assert_eq!(tensors[1].name, "im_size");
    assert_eq!(tensors[1].shape, vec![2, 2]);
    match tensors[1].data {
      TensorData::I32(size) => assert_eq!(size, &[480, 640, 200, 320]),
      _ => panic!("im_size 应为 int32"),
    }
  }

  #[test]
  fn three_feed_detection_adds_info() {
    let d = descriptor(
      ResizePolicy::RangeScaled {
        target_short_size: 4,
        max_size: 8,
      },
      3,
    );
    let marshaler = TensorMarshaler::new(&d);
    assert_eq!(
      marshaler.roles(),
      &[FeedRole::Image, FeedRole::Info, FeedRole::ImSize]
    );
    let buffer = NormalizedBuffer::with_shape(1, 3, 4, 8);
    let geometry = [meta(4, 2, 8, 4, 2.0)];
    let feeds = marshaler.marshal(&buffer, &geometry).unwrap();
    let names = names(marshaler.roles());
    let tensors = feeds.tensors(marshaler.roles(), &names);
    assert_eq!(tensors.len(), 3);
    assert_eq!(tensors[0].shape, vec![1, 3, 4, 8]);
    match (tensors[1].data, tensors[2].data) {
      (TensorData::F32(info), TensorData::F32(size)) => {
        assert_eq!(info, &[4.0, 8.0, 2.0]);
        assert_eq!(size, &[2.0, 4.0, 1.0]);
      }
      _ => panic!("info/im_size 应为 float32"),
    }
    assert_eq!(tensors[2].shape, vec![1, 3]);
  }

  #[test]
  fn buffer_size_must_match_first_geometry() {
    let d = descriptor(
      ResizePolicy::RangeScaled {
        target_short_size: 4,
        max_size: 8,
      },
      3,
    );
    let marshaler = TensorMarshaler::new(&d);
    let buffer = NormalizedBuffer::with_shape(1, 3, 4, 4);
    let geometry = [meta(4, 2, 8, 4, 2.0)];
    let err = marshaler.marshal(&buffer, &geometry).unwrap_err();
    assert!(matches!(err, PipelineError::ShapeMismatch(_)));
  }
}
