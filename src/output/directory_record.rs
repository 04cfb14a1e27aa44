// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use chrono::{Datelike, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  error::ErrorKind,
  geometry::GeometryMetadata,
  model::{BatchResults, Classification, DetectItem},
  output::Render,
  task::BatchReport,
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum ImageResult<'a> {
  Classification(&'a Classification),
  Detection(&'a [DetectItem]),
}

#[derive(Debug, Serialize)]
struct ImageRecord<'a> {
  path: &'a Path,
  #[serde(skip_serializing_if = "Option::is_none")]
  geometry: Option<&'a GeometryMetadata>,
  #[serde(skip_serializing_if = "Option::is_none")]
  result: Option<ImageResult<'a>>,
}

#[derive(Debug, Serialize)]
struct BatchRecord<'a> {
  batch: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<ErrorKind>,
  #[serde(skip_serializing_if = "Option::is_none")]
  message: Option<String>,
  images: Vec<ImageRecord<'a>>,
}

impl<'a> BatchRecord<'a> {
  fn from_report(report: &'a BatchReport) -> Self {
    let result = |i: usize| match &report.outcome {
      Ok(BatchResults::Classification(results)) => {
        results.get(i).map(ImageResult::Classification)
      }
      Ok(BatchResults::Detection(results)) => results
        .get(i)
        .map(|r| ImageResult::Detection(&r.items)),
      Err(_) => None,
    };
    let images = report
      .images
      .iter()
      .enumerate()
      .map(|(i, path)| ImageRecord {
        path,
        geometry: report.geometry.get(i),
        result: result(i),
      })
      .collect();

    BatchRecord {
      batch: report.index,
      error: report.kind(),
      message: report.outcome.as_ref().err().map(|e| e.to_string()),
      images,
    }
  }
}

/// 每个批次写入一条 JSON 记录: `<dir>/YYYY/MM/DD/HH-MM-SS-XXXX.json`
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counters: AtomicU16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput::new(uri.path()).with_always(always))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    DirectoryRecordOutput {
      directory: directory.into(),
      frame_counters: AtomicU16::new(0),
      always: false,
    }
  }

  /// 未检测到任何物体的批次也写入记录
  pub fn with_always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  fn frame_id(&self) -> u16 {
    self.frame_counters.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.json",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

fn has_detections(report: &BatchReport) -> bool {
  match &report.outcome {
    Ok(BatchResults::Detection(results)) => results.iter().any(|r| !r.is_empty()),
    _ => true,
  }
}

impl Render for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, report: &BatchReport) -> Result<(), Self::Error> {
    if !self.always && !has_detections(report) {
      debug!("第 {} 批没有检测结果, 跳过记录", report.index);
      return Ok(());
    }
    let path = self.frame_path()?;
    let record = BatchRecord::from_report(report);
    std::fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
    debug!("第 {} 批记录写入 {}", report.index, path.display());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{error::PipelineError, model::DetectResult};

  fn records(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
      for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          pending.push(path);
        } else {
          found.push(path);
        }
      }
    }
    found.sort();
    found
  }

  fn detection(items: Vec<DetectItem>) -> BatchReport {
    BatchReport {
      index: 0,
      images: vec![PathBuf::from("a.png")],
      geometry: vec![GeometryMetadata::default()],
      outcome: Ok(BatchResults::Detection(vec![DetectResult {
        items: items.into_boxed_slice(),
      }])),
    }
  }

  #[test]
  fn writes_one_record_per_batch() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();

    let report = detection(vec![DetectItem {
      class_id: 3,
      score: 0.75,
      bbox: [1.0, 2.0, 3.0, 4.0],
    }]);
    output.render_result(&report).unwrap();

    let failed = BatchReport {
      index: 1,
      images: vec![PathBuf::from("b.png"), PathBuf::from("c.png")],
      geometry: Vec::new(),
      outcome: Err(PipelineError::decode_failed("c.png", "truncated")),
    };
    output.render_result(&failed).unwrap();

    let files = records(dir.path());
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.extension().unwrap() == "json"));

    let values: Vec<serde_json::Value> = files
      .iter()
      .map(|f| serde_json::from_slice(&std::fs::read(f).unwrap()).unwrap())
      .collect();
    let ok = values.iter().find(|v| v["batch"] == 0).unwrap();
    assert_eq!(ok["images"][0]["result"]["detection"][0]["class_id"], 3);
    let bad = values.iter().find(|v| v["batch"] == 1).unwrap();
    assert_eq!(bad["error"], "decode_failed");
    assert_eq!(bad["images"].as_array().unwrap().len(), 2);
  }

  #[test]
  fn empty_detections_skipped_unless_always() {
    let dir = tempfile::tempdir().unwrap();
    let output = DirectoryRecordOutput::new(dir.path());
    output.render_result(&detection(Vec::new())).unwrap();
    assert!(records(dir.path()).is_empty());

    let output = output.with_always(true);
    output.render_result(&detection(Vec::new())).unwrap();
    assert_eq!(records(dir.path()).len(), 1);
  }

  #[test]
  fn rejects_wrong_scheme() {
    let url = url::Url::parse("file:///tmp/out").unwrap();
    assert!(matches!(
      DirectoryRecordOutput::from_url(&url),
      Err(DirectoryRecordOutputError::SchemeMismatch)
    ));
  }
}
