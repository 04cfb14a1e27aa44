// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/classify.rs - 分类输出解码
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
  model::{Classification, Model},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier;

/// 线性扫描取最大值，严格大于才替换，相等时保留靠前的下标
fn argmax(scores: &[f32]) -> Classification {
  let mut best = 0usize;
  for (j, &score) in scores.iter().enumerate() {
    if score > scores[best] {
      best = j;
    }
  }
  Classification {
    class_id: best,
    score: scores[best],
  }
}

impl Model for Classifier {
  type Output = Classification;

  fn postprocess(&self, output: &RawOutput, batch_size: usize) -> Result<Vec<Self::Output>, PipelineError> {
    debug!("分类输出形状: {:?}", output.shape);
    let values = output.to_f32()?;
    let total = values.len();
    if batch_size == 0 || total == 0 || total % batch_size != 0 {
      error!("输出元素个数 {} 无法按批大小 {} 均分", total, batch_size);
      return Err(PipelineError::shape(format!(
        "输出元素个数 {} 无法按批大小 {} 均分",
        total, batch_size
      )));
    }

    let per_image = total / batch_size;
    Ok(values.chunks_exact(per_image).map(argmax).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn picks_argmax_per_image() {
    let raw = RawOutput::from_f32(
      vec![2, 4],
      &[0.1, 0.9, 0.2, 0.05, 0.3, 0.3, 0.7, 0.1],
      None,
    );
    let results = Classifier.postprocess(&raw, 2).unwrap();
    assert_eq!(
      results,
      vec![
        Classification {
          class_id: 1,
          score: 0.9
        },
        Classification {
          class_id: 2,
          score: 0.7
        },
      ]
    );
  }

  #[test]
  fn ties_keep_first_index() {
    let raw = RawOutput::from_f32(vec![1, 4], &[0.2, 0.5, 0.5, 0.1], None);
    let results = Classifier.postprocess(&raw, 1).unwrap();
    assert_eq!(results[0].class_id, 1);
  }

  #[test]
  fn indivisible_output_is_shape_mismatch() {
    let raw = RawOutput::from_f32(vec![7], &[0.0; 7], None);
    let err = Classifier.postprocess(&raw, 2).unwrap_err();
    assert!(matches!(err, PipelineError::ShapeMismatch(_)));
  }

  #[test]
  fn byte_length_checked_before_indexing() {
    let mut raw = RawOutput::from_f32(vec![2, 2], &[0.0; 4], None);
    raw.data.truncate(8);
    assert!(matches!(
      Classifier.postprocess(&raw, 2),
      Err(PipelineError::ShapeMismatch(_))
    ));
  }

  #[test]
  fn huge_declared_shape_is_rejected() {
    let raw = RawOutput::from_f32(vec![usize::MAX, 2], &[], None);
    assert!(matches!(
      Classifier.postprocess(&raw, 1),
      Err(PipelineError::ShapeMismatch(_))
    ));
  }
}
