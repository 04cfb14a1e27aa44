// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 模型描述符
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
  path::{Path, PathBuf},
  time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, error::PipelineError, geometry::ResizePolicy};

/// 推理引擎的执行模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
  /// 通过中间张量对象拷贝输入输出
  #[default]
  #[serde(alias = "NATIVE")]
  Legacy,
  /// 直接按名称寻址引擎的输入输出
  #[serde(alias = "ANALYSIS")]
  ZeroCopy,
}

/// 模型期望的通道顺序
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
  #[default]
  Rgb,
  Bgr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
  Classification,
  Detection,
}

/// 模型描述符，初始化时加载一次，之后只读
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelDescriptor {
  #[serde(default)]
  pub model_path: PathBuf,
  #[serde(default = "default_model_file_name")]
  pub model_file_name: String,
  #[serde(default = "default_param_file_name")]
  pub param_file_name: String,
  #[serde(default)]
  pub use_gpu: bool,
  #[serde(default)]
  pub predictor_mode: ExecutionMode,
  pub batch_size: usize,
  #[serde(default = "default_channels")]
  pub channels: usize,
  #[serde(default)]
  pub channel_order: ChannelOrder,
  pub mean: Vec<f32>,
  pub std: Vec<f32>,
  /// 模型输入张量个数：分类为 1，检测为 2 或 3
  #[serde(default = "default_feeds_size")]
  pub feeds_size: usize,
  pub resize: ResizePolicy,
  #[serde(default)]
  pub decode_timeout_ms: Option<u64>,
}

fn default_model_file_name() -> String {
  "__model__".to_string()
}

fn default_param_file_name() -> String {
  "__params__".to_string()
}

fn default_channels() -> usize {
  3
}

fn default_feeds_size() -> usize {
  1
}

impl ModelDescriptor {
  pub fn from_json_str(text: &str) -> Result<Self, PipelineError> {
    let descriptor: ModelDescriptor = serde_json::from_str(text)
      .map_err(|e| PipelineError::ConfigInvalid(format!("无法解析模型配置: {}", e)))?;
    descriptor.validate()?;
    Ok(descriptor)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
    let path = path.as_ref();
    info!("加载模型配置: {}", path.display());
    let text = std::fs::read_to_string(path).map_err(|e| {
      PipelineError::ConfigInvalid(format!("无法读取模型配置 {}: {}", path.display(), e))
    })?;
    Self::from_json_str(&text)
  }

  pub fn validate(&self) -> Result<(), PipelineError> {
    let invalid = |msg: String| Err(PipelineError::ConfigInvalid(msg));

    if self.channels != 1 && self.channels != 3 {
      return invalid(format!("通道数必须为 1 或 3, 实际为 {}", self.channels));
    }
    if self.mean.len() != self.channels || self.std.len() != self.channels {
      return invalid(format!(
        "mean/std 长度必须等于通道数 {}, 实际为 {}/{}",
        self.channels,
        self.mean.len(),
        self.std.len()
      ));
    }
    if let Some((i, s)) = self
      .std
      .iter()
      .enumerate()
      .find(|(_, s)| !s.is_finite() || **s <= 0.0)
    {
      return invalid(format!("std[{}] 必须为正数, 实际为 {}", i, s));
    }
    if self.mean.iter().any(|m| !m.is_finite()) {
      return invalid("mean 中存在非有限值".to_string());
    }
    if self.batch_size == 0 {
      return invalid("batch_size 必须大于 0".to_string());
    }

    match self.resize {
      ResizePolicy::FixedCrop {
        crop_short_size,
        width,
        height,
      } => {
        if width == 0 || height == 0 {
          return invalid("裁剪尺寸必须大于 0".to_string());
        }
        if crop_short_size < width.max(height) {
          return invalid(format!(
            "crop_short_size {} 小于裁剪尺寸 {}x{}",
            crop_short_size, width, height
          ));
        }
        if self.feeds_size != 1 {
          return invalid(format!(
            "分类模型只接受 1 个输入, 配置为 {}",
            self.feeds_size
          ));
        }
      }
      ResizePolicy::Unpadded { width, height } => {
        if width == 0 || height == 0 {
          return invalid("缩放尺寸必须大于 0".to_string());
        }
      }
      ResizePolicy::RangeScaled {
        target_short_size,
        max_size,
      } => {
        if target_short_size == 0 || max_size == 0 {
          return invalid("target_short_size 与 max_size 必须大于 0".to_string());
        }
      }
    }

    if self.task() == TaskKind::Detection {
      if self.feeds_size != 2 && self.feeds_size != 3 {
        return invalid(format!(
          "检测模型输入个数必须为 2 或 3, 实际为 {}",
          self.feeds_size
        ));
      }
      match (self.resize, self.feeds_size) {
        (ResizePolicy::Unpadded { .. }, 3) | (ResizePolicy::RangeScaled { .. }, 2) => {
          warn!(
            "缩放策略 {:?} 与输入个数 {} 的组合不常见",
            self.resize, self.feeds_size
          );
        }
        _ => {}
      }
    }

    debug!("模型配置校验通过: {:?}", self);
    Ok(())
  }

  pub fn task(&self) -> TaskKind {
    match self.resize {
      ResizePolicy::FixedCrop { .. } => TaskKind::Classification,
      ResizePolicy::Unpadded { .. } | ResizePolicy::RangeScaled { .. } => TaskKind::Detection,
    }
  }

  pub fn decode_timeout(&self) -> Option<Duration> {
    self.decode_timeout_ms.map(Duration::from_millis)
  }

  pub fn model_file(&self) -> PathBuf {
    self.model_path.join(&self.model_file_name)
  }

  pub fn param_file(&self) -> PathBuf {
    self.model_path.join(&self.param_file_name)
  }
}

impl FromUrlWithScheme for ModelDescriptor {
  const SCHEME: &'static str = "model";
}

impl FromUrl for ModelDescriptor {
  type Error = PipelineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(PipelineError::ConfigInvalid(format!(
        "模型配置路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }
    Self::load(url.path())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const DETECTION: &str = r#"{
    "model_path": "/models/yolo",
    "predictor_mode": "ANALYSIS",
    "batch_size": 2,
    "mean": [0.485, 0.456, 0.406],
    "std": [0.229, 0.224, 0.225],
    "feeds_size": 2,
    "resize": { "resize_type": "unpadded", "width": 608, "height": 608 }
  }"#;

  #[test]
  fn parses_detection_descriptor() {
    let descriptor = ModelDescriptor::from_json_str(DETECTION).unwrap();
    assert_eq!(descriptor.predictor_mode, ExecutionMode::ZeroCopy);
    assert_eq!(descriptor.task(), TaskKind::Detection);
    assert_eq!(descriptor.channels, 3);
    assert_eq!(descriptor.channel_order, ChannelOrder::Rgb);
    assert_eq!(
      descriptor.model_file(),
      PathBuf::from("/models/yolo/__model__")
    );
    assert_eq!(descriptor.decode_timeout(), None);
  }

  #[test]
  fn mean_length_must_match_channels() {
    let text = DETECTION.replace("[0.485, 0.456, 0.406]", "[0.5]");
    let err = ModelDescriptor::from_json_str(&text).unwrap_err();
    assert!(matches!(err, PipelineError::ConfigInvalid(_)));
  }

  #[test]
  fn detection_needs_two_or_three_feeds() {
    let text = DETECTION.replace("\"feeds_size\": 2", "\"feeds_size\": 4");
    assert!(ModelDescriptor::from_json_str(&text).is_err());
  }

  #[test]
  fn crop_must_fit_inside_short_side() {
    let text = r#"{
      "batch_size": 4,
      "mean": [0.5, 0.5, 0.5],
      "std": [0.5, 0.5, 0.5],
      "resize": { "resize_type": "fixed_crop", "crop_short_size": 200, "width": 224, "height": 224 }
    }"#;
    assert!(ModelDescriptor::from_json_str(text).is_err());

    let ok = text.replace("200", "256");
    let descriptor = ModelDescriptor::from_json_str(&ok).unwrap();
    assert_eq!(descriptor.task(), TaskKind::Classification);
    assert_eq!(descriptor.predictor_mode, ExecutionMode::Legacy);
  }

  #[test]
  fn malformed_json_is_config_invalid() {
    let err = ModelDescriptor::from_json_str("{ not json").unwrap_err();
    assert!(matches!(err, PipelineError::ConfigInvalid(_)));
  }
}
