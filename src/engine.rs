// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine.rs - 推理引擎抽象
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

use thiserror::Error;

use crate::{
  config::ExecutionMode,
  error::PipelineError,
  tensor::{FeedRole, FeedTensor},
};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("后端错误: {0}")]
  Backend(String),
  #[error("缺少输出: {0}")]
  MissingOutput(String),
  #[error("模型声明了 {declared} 个输入, 期望 {expected} 个")]
  FeedCountMismatch { expected: usize, declared: usize },
  #[error("未知输入: {0}")]
  UnknownFeed(String),
  #[error("回放数据已耗尽")]
  Exhausted,
}

/// 引擎返回的原始输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
  pub shape: Vec<usize>,
  /// 原始字节，按本机字节序存放的 f32
  pub data: Vec<u8>,
  /// 检测输出的偏移表，长度为 batch + 1
  pub offsets: Option<Vec<usize>>,
}

impl RawOutput {
  pub fn from_f32(shape: Vec<usize>, values: &[f32], offsets: Option<Vec<usize>>) -> Self {
    let data = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
    Self {
      shape,
      data,
      offsets,
    }
  }

  /// 形状声明的元素个数，溢出时为 `None`
  pub fn element_count(&self) -> Option<usize> {
    self
      .shape
      .iter()
      .try_fold(1usize, |count, &dim| count.checked_mul(dim))
  }

  /// 校验字节长度与声明的元素个数一致后转换为 f32
  pub fn to_f32(&self) -> Result<Vec<f32>, PipelineError> {
    let elem = std::mem::size_of::<f32>();
    let (count, bytes) = self
      .element_count()
      .and_then(|count| count.checked_mul(elem).map(|bytes| (count, bytes)))
      .ok_or_else(|| PipelineError::shape(format!("输出形状 {:?} 的元素个数溢出", self.shape)))?;
    if self.data.len() != bytes {
      return Err(PipelineError::shape(format!(
        "输出字节数 {} 与形状 {:?} 声明的 {} 个元素不一致",
        self.data.len(),
        self.shape,
        count
      )));
    }
    Ok(
      self
        .data
        .chunks_exact(elem)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect(),
    )
  }
}

/// 推理引擎能力：决定输入张量如何命名、如何执行以及如何取回第一个输出
pub trait InferenceEngine {
  fn mode(&self) -> ExecutionMode;

  /// 为各输入角色解析引擎侧名称，返回顺序与 `roles` 一致
  fn bind_feeds(&self, roles: &[FeedRole]) -> Result<Vec<String>, EngineError>;

  fn infer(&mut self, feeds: &[FeedTensor<'_>], batch_size: usize) -> Result<RawOutput, EngineError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
  fn mode(&self) -> ExecutionMode {
    (**self).mode()
  }

  fn bind_feeds(&self, roles: &[FeedRole]) -> Result<Vec<String>, EngineError> {
    (**self).bind_feeds(roles)
  }

  fn infer(&mut self, feeds: &[FeedTensor<'_>], batch_size: usize) -> Result<RawOutput, EngineError> {
    (**self).infer(feeds, batch_size)
  }
}

mod legacy;
mod replay;
mod zero_copy;

pub use self::legacy::{LegacyBackend, LegacyEngine};
pub use self::replay::{ReplayBackend, Recording};
pub use self::zero_copy::{ZeroCopyBackend, ZeroCopyEngine};
