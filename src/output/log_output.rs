// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/log_output.rs - 日志输出
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

use std::convert::Infallible;

use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, model::BatchResults, output::Render, task::BatchReport,
};

/// 通过 tracing 打印逐图像结果
#[derive(Debug, Clone, Default)]
pub struct LogOutput {
  /// 低于该分数的检测框只在 debug 级别输出
  threshold: f32,
}

impl LogOutput {
  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.threshold = threshold;
    self
  }
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = Infallible;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let threshold = url
      .query_pairs()
      .find(|(k, _)| k == "threshold")
      .and_then(|(_, v)| v.parse().ok())
      .unwrap_or_default();
    Ok(LogOutput { threshold })
  }
}

impl Render for LogOutput {
  type Error = Infallible;

  fn render_result(&self, report: &BatchReport) -> Result<(), Self::Error> {
    let results = match &report.outcome {
      Ok(results) => results,
      Err(e) => {
        error!("第 {} 批 [{}]: {}", report.index, e.kind(), e);
        return Ok(());
      }
    };

    match results {
      BatchResults::Classification(results) => {
        for (path, result) in report.images.iter().zip(results) {
          info!(
            "img[{}], class: {}, score: {:e}",
            path.display(),
            result.class_id,
            result.score
          );
        }
      }
      BatchResults::Detection(results) => {
        for (path, result) in report.images.iter().zip(results) {
          info!("img[{}], 检测到 {} 个物体", path.display(), result.len());
          for item in result.items.iter() {
            let [left, top, right, bottom] = item.bbox;
            if item.score >= self.threshold {
              info!(
                "  class {}, score = {:.4}, left top = [{:.2}, {:.2}], right bottom = [{:.2}, {:.2}]",
                item.class_id, item.score, left, top, right, bottom
              );
            } else {
              debug!(
                "  class {}, score = {:.4}, left top = [{:.2}, {:.2}], right bottom = [{:.2}, {:.2}]",
                item.class_id, item.score, left, top, right, bottom
              );
            }
          }
        }
      }
    }
    Ok(())
  }
}
