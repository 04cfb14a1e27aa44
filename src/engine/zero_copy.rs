// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/zero_copy.rs - 零拷贝执行模式
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
  config::ExecutionMode,
  engine::{EngineError, InferenceEngine, RawOutput},
  tensor::{FeedRole, FeedTensor, TensorData},
};

/// 零拷贝协议：按引擎声明的名称逐个写入输入，执行后按名称读取输出
pub trait ZeroCopyBackend {
  fn input_names(&self) -> Vec<String>;
  fn output_names(&self) -> Vec<String>;
  /// 按 `shape` 重设输入张量形状并拷入数据
  fn copy_from_cpu(
    &mut self,
    name: &str,
    shape: &[usize],
    data: TensorData<'_>,
  ) -> Result<(), EngineError>;
  fn zero_copy_run(&mut self) -> Result<(), EngineError>;
  /// 读取指定输出，连同其偏移表
  fn copy_to_cpu(&self, name: &str) -> Result<RawOutput, EngineError>;
}

pub struct ZeroCopyEngine<B> {
  backend: B,
}

impl<B: ZeroCopyBackend> ZeroCopyEngine<B> {
  pub fn new(backend: B) -> Self {
    Self { backend }
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }
}

impl<B: ZeroCopyBackend> InferenceEngine for ZeroCopyEngine<B> {
  fn mode(&self) -> ExecutionMode {
    ExecutionMode::ZeroCopy
  }

  /// 第一个声明的输入为图像，最后一个为原始尺寸，三输入时第二个为缩放信息
  fn bind_feeds(&self, roles: &[FeedRole]) -> Result<Vec<String>, EngineError> {
    let declared = self.backend.input_names();
    if declared.len() != roles.len() {
      return Err(EngineError::FeedCountMismatch {
        expected: roles.len(),
        declared: declared.len(),
      });
    }
    let last = declared.len() - 1;
    roles
      .iter()
      .map(|role| {
        let index = match role {
          FeedRole::Image => 0,
          FeedRole::Info => 1,
          FeedRole::ImSize => last,
        };
        declared
          .get(index)
          .cloned()
          .ok_or_else(|| EngineError::UnknownFeed(role.legacy_name().to_string()))
      })
      .collect()
  }

  fn infer(&mut self, feeds: &[FeedTensor<'_>], batch_size: usize) -> Result<RawOutput, EngineError> {
    for feed in feeds {
      debug!("写入输入 {}: {:?}", feed.name, feed.shape);
      self.backend.copy_from_cpu(feed.name, &feed.shape, feed.data)?;
    }
    debug!("执行零拷贝推理, batch = {}", batch_size);
    self.backend.zero_copy_run()?;

    let output_names = self.backend.output_names();
    let first = output_names
      .first()
      .ok_or_else(|| EngineError::MissingOutput("output_names[0]".to_string()))?;
    self.backend.copy_to_cpu(first)
  }
}
