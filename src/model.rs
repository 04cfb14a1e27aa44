// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型输出解码
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

use serde::Serialize;

use crate::{engine::RawOutput, error::PipelineError};

/// 将引擎原始输出解码为逐图像结果
pub trait Model {
  type Output;

  fn postprocess(&self, output: &RawOutput, batch_size: usize) -> Result<Vec<Self::Output>, PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
  pub class_id: usize,
  pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectItem {
  pub class_id: i32,
  pub score: f32,
  pub bbox: [f32; 4], // [left, top, right, bottom]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

/// 一个批次的解码结果，按图像原始顺序排列
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchResults {
  Classification(Vec<Classification>),
  Detection(Vec<DetectResult>),
}

impl BatchResults {
  pub fn len(&self) -> usize {
    match self {
      BatchResults::Classification(results) => results.len(),
      BatchResults::Detection(results) => results.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

mod classify;
mod detect;

pub use self::classify::Classifier;
pub use self::detect::{DETECTION_RECORD_FIELDS, Detector};
