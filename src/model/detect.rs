// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/detect.rs - 检测输出解码
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

use tracing::{debug, error};

use crate::{
  engine::RawOutput,
  error::PipelineError,
  model::{DetectItem, DetectResult, Model},
};

/// 每条检测记录: class, score, x1, y1, x2, y2
pub const DETECTION_RECORD_FIELDS: usize = 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct Detector;

fn check_offsets(offsets: &[usize], batch_size: usize, records: usize) -> Result<(), PipelineError> {
  if offsets.len() != batch_size + 1 {
    return Err(PipelineError::shape(format!(
      "偏移表长度为 {}, 期望 {}",
      offsets.len(),
      batch_size + 1
    )));
  }
  if offsets.windows(2).any(|w| w[0] > w[1]) {
    return Err(PipelineError::shape(format!("偏移表不是非递减序列: {:?}", offsets)));
  }
  let last = offsets.last().copied().unwrap_or(0);
  if last > records {
    return Err(PipelineError::shape(format!(
      "偏移表末尾 {} 超出记录总数 {}",
      last, records
    )));
  }
  Ok(())
}

fn to_item(record: &[f32]) -> DetectItem {
  DetectItem {
    class_id: record[0].round() as i32,
    score: record[1],
    bbox: [record[2], record[3], record[4], record[5]],
  }
}

impl Model for Detector {
  type Output = DetectResult;

  fn postprocess(&self, output: &RawOutput, batch_size: usize) -> Result<Vec<Self::Output>, PipelineError> {
    debug!("检测输出形状: {:?}", output.shape);
    let values = output.to_f32()?;
    if values.len() % DETECTION_RECORD_FIELDS != 0 {
      return Err(PipelineError::shape(format!(
        "输出元素个数 {} 不是 {} 的整数倍",
        values.len(),
        DETECTION_RECORD_FIELDS
      )));
    }
    let records = values.len() / DETECTION_RECORD_FIELDS;

    let offsets = output
      .offsets
      .as_deref()
      .ok_or_else(|| PipelineError::shape("检测输出缺少偏移表"))?;
    check_offsets(offsets, batch_size, records).inspect_err(|e| error!("{}", e))?;

    let results = offsets
      .windows(2)
      .map(|w| {
        let run = &values[w[0] * DETECTION_RECORD_FIELDS..w[1] * DETECTION_RECORD_FIELDS];
        let items = run
          .chunks_exact(DETECTION_RECORD_FIELDS)
          .map(to_item)
          .collect::<Vec<_>>();
        DetectResult {
          items: items.into_boxed_slice(),
        }
      })
      .collect::<Vec<_>>();

    debug!(
      "检测到 {} 个物体",
      results.iter().map(DetectResult::len).sum::<usize>()
    );
    Ok(results)
  }
}
