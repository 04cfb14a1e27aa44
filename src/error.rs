// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 流水线错误定义
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

use std::{path::PathBuf, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("模型配置无效: {0}")]
  ConfigInvalid(String),
  #[error("图像解码失败: {path:?}, 原因: {reason}")]
  DecodeFailed { path: PathBuf, reason: String },
  #[error("图像解码超时: {path:?}, 超过 {timeout:?}")]
  DecodeTimeout { path: PathBuf, timeout: Duration },
  #[error("批次已取消")]
  Cancelled,
  #[error("批次内图像尺寸不一致: 第 {index} 张为 {actual:?}, 期望 {expected:?}")]
  GeometryMismatch {
    index: usize,
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("输出形状不匹配: {0}")]
  ShapeMismatch(String),
  #[error("推理引擎调用失败: {0}")]
  EngineInvocationFailed(#[from] EngineError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  Json(#[from] serde_json::Error),
}

impl PipelineError {
  pub fn decode_failed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
    PipelineError::DecodeFailed {
      path: path.into(),
      reason: reason.to_string(),
    }
  }

  pub fn shape(msg: impl Into<String>) -> Self {
    PipelineError::ShapeMismatch(msg.into())
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      PipelineError::ConfigInvalid(_) => ErrorKind::ConfigInvalid,
      PipelineError::DecodeFailed { .. } => ErrorKind::DecodeFailed,
      PipelineError::DecodeTimeout { .. } => ErrorKind::DecodeTimeout,
      PipelineError::Cancelled => ErrorKind::Cancelled,
      PipelineError::GeometryMismatch { .. } => ErrorKind::GeometryMismatch,
      PipelineError::ShapeMismatch(_) => ErrorKind::ShapeMismatch,
      PipelineError::EngineInvocationFailed(_) => ErrorKind::EngineInvocationFailed,
      PipelineError::Io(_) | PipelineError::Json(_) => ErrorKind::Io,
    }
  }
}

/// 批次报告与统计中使用的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  ConfigInvalid,
  DecodeFailed,
  DecodeTimeout,
  Cancelled,
  GeometryMismatch,
  ShapeMismatch,
  EngineInvocationFailed,
  Io,
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      ErrorKind::ConfigInvalid => "config_invalid",
      ErrorKind::DecodeFailed => "decode_failed",
      ErrorKind::DecodeTimeout => "decode_timeout",
      ErrorKind::Cancelled => "cancelled",
      ErrorKind::GeometryMismatch => "geometry_mismatch",
      ErrorKind::ShapeMismatch => "shape_mismatch",
      ErrorKind::EngineInvocationFailed => "engine_invocation_failed",
      ErrorKind::Io => "io",
    };
    f.write_str(name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kind_follows_variant() {
    let err = PipelineError::decode_failed("a.png", "empty");
    assert_eq!(err.kind(), ErrorKind::DecodeFailed);
    assert_eq!(err.kind().to_string(), "decode_failed");

    let err = PipelineError::from(EngineError::Backend("boom".into()));
    assert_eq!(err.kind(), ErrorKind::EngineInvocationFailed);
  }
}
