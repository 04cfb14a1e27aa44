// 该文件是 Shanan （山南西风） 项目的一部分。
// src/engine/replay.rs - 回放已记录的推理输出
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

use std::{collections::VecDeque, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  engine::{EngineError, LegacyBackend, RawOutput, ZeroCopyBackend},
  error::PipelineError,
  tensor::{FeedTensor, TensorData},
};

/// 一次推理的输出记录
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Recording {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
  #[serde(default)]
  pub lod: Option<Vec<usize>>,
}

impl From<Recording> for RawOutput {
  fn from(recording: Recording) -> Self {
    RawOutput::from_f32(recording.shape, &recording.data, recording.lod)
  }
}

#[derive(Debug, Deserialize)]
struct ReplayFile {
  #[serde(default)]
  input_names: Vec<String>,
  #[serde(default = "default_output_name")]
  output_name: String,
  outputs: Vec<Recording>,
}

fn default_output_name() -> String {
  "output".to_string()
}

/// 按顺序回放记录的输出，每个批次消耗一条记录
pub struct ReplayBackend {
  input_names: Vec<String>,
  output_name: String,
  outputs: VecDeque<Recording>,
  current: Option<RawOutput>,
}

impl ReplayBackend {
  pub fn new(input_names: Vec<String>, outputs: Vec<Recording>) -> Self {
    Self {
      input_names,
      output_name: default_output_name(),
      outputs: outputs.into(),
      current: None,
    }
  }

  pub fn from_json_str(text: &str) -> Result<Self, PipelineError> {
    let file: ReplayFile = serde_json::from_str(text)?;
    Ok(Self {
      input_names: file.input_names,
      output_name: file.output_name,
      outputs: file.outputs.into(),
      current: None,
    })
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
    let path = path.as_ref();
    info!("加载回放记录: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let backend = Self::from_json_str(&text)?;
    debug!("共 {} 条输出记录", backend.remaining());
    Ok(backend)
  }

  pub fn remaining(&self) -> usize {
    self.outputs.len()
  }

  fn next_output(&mut self) -> Result<RawOutput, EngineError> {
    self
      .outputs
      .pop_front()
      .map(RawOutput::from)
      .ok_or(EngineError::Exhausted)
  }
}

impl FromUrlWithScheme for ReplayBackend {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayBackend {
  type Error = PipelineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(PipelineError::ConfigInvalid(format!(
        "回放路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }
    Self::load(url.path())
  }
}

impl LegacyBackend for ReplayBackend {
  fn run(&mut self, feeds: &[FeedTensor<'_>], batch_size: usize) -> Result<Vec<RawOutput>, EngineError> {
    for feed in feeds {
      debug!("回放输入 {}: {:?} {:?}", feed.name, feed.shape, feed.dtype());
    }
    debug!("回放批次, batch = {}", batch_size);
    Ok(vec![self.next_output()?])
  }
}

impl ZeroCopyBackend for ReplayBackend {
  fn input_names(&self) -> Vec<String> {
    self.input_names.clone()
  }

  fn output_names(&self) -> Vec<String> {
    vec![self.output_name.clone()]
  }

  fn copy_from_cpu(&mut self, name: &str, shape: &[usize], data: TensorData<'_>) -> Result<(), EngineError> {
    if !self.input_names.iter().any(|n| n == name) {
      return Err(EngineError::UnknownFeed(name.to_string()));
    }
    let expected: usize = shape.iter().product();
    if expected != data.len() {
      return Err(EngineError::Backend(format!(
        "输入 {} 形状 {:?} 与数据长度 {} 不一致",
        name,
        shape,
        data.len()
      )));
    }
    Ok(())
  }

  fn zero_copy_run(&mut self) -> Result<(), EngineError> {
    self.current = Some(self.next_output()?);
    Ok(())
  }

  fn copy_to_cpu(&self, name: &str) -> Result<RawOutput, EngineError> {
    if name != self.output_name {
      return Err(EngineError::MissingOutput(name.to_string()));
    }
    self
      .current
      .clone()
      .ok_or_else(|| EngineError::MissingOutput(name.to_string()))
  }
}
