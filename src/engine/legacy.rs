// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/legacy.rs - 旧式执行模式
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
  tensor::{FeedRole, FeedTensor},
};

/// 旧式协议：一次调用传入全部输入张量，返回输出张量列表
pub trait LegacyBackend {
  fn run(
    &mut self,
    feeds: &[FeedTensor<'_>],
    batch_size: usize,
  ) -> Result<Vec<RawOutput>, EngineError>;
}

pub struct LegacyEngine<B> {
  backend: B,
}

impl<B: LegacyBackend> LegacyEngine<B> {
  pub fn new(backend: B) -> Self {
    Self { backend }
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }
}

impl<B: LegacyBackend> InferenceEngine for LegacyEngine<B> {
  fn mode(&self) -> ExecutionMode {
    ExecutionMode::Legacy
  }

  fn bind_feeds(&self, roles: &[FeedRole]) -> Result<Vec<String>, EngineError> {
    Ok(roles.iter().map(|r| r.legacy_name().to_string()).collect())
  }

  fn infer(&mut self, feeds: &[FeedTensor<'_>], batch_size: usize) -> Result<RawOutput, EngineError> {
    let outputs = self.backend.run(feeds, batch_size)?;
    debug!("输出个数: {}", outputs.len());
    outputs
      .into_iter()
      .next()
      .ok_or_else(|| EngineError::MissingOutput("outputs[0]".to_string()))
  }
}
