// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 缩放策略与几何信息
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

use serde::{Deserialize, Serialize};

/// 图像缩放策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "resize_type", rename_all = "snake_case")]
pub enum ResizePolicy {
  /// 短边缩放到 `crop_short_size`，再从中心裁剪出 `width`x`height`（分类）
  FixedCrop {
    crop_short_size: u32,
    width: u32,
    height: u32,
  },
  /// 直接缩放到固定尺寸（2 输入检测模型）
  Unpadded { width: u32, height: u32 },
  /// 等比缩放：短边不超过 `target_short_size`，长边不超过 `max_size`（3 输入检测模型）
  RangeScaled { target_short_size: u32, max_size: u32 },
}

/// 单张图像的缩放规划结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
  pub resized_width: u32,
  pub resized_height: u32,
  pub scale_ratio: f32,
  /// 缩放后的中心裁剪尺寸 (宽, 高)
  pub crop: Option<(u32, u32)>,
}

impl Geometry {
  pub fn needs_resize(&self, width: u32, height: u32) -> bool {
    self.resized_width != width || self.resized_height != height
  }

  /// 最终写入张量的 (宽, 高)
  pub fn tensor_size(&self) -> (u32, u32) {
    self
      .crop
      .unwrap_or((self.resized_width, self.resized_height))
  }
}

/// 每张图像在批次中的几何元数据
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct GeometryMetadata {
  pub original_width: u32,
  pub original_height: u32,
  pub resized_width: u32,
  pub resized_height: u32,
  pub scale_ratio: f32,
}

impl GeometryMetadata {
  pub fn new(original_width: u32, original_height: u32, geometry: &Geometry) -> Self {
    Self {
      original_width,
      original_height,
      resized_width: geometry.resized_width,
      resized_height: geometry.resized_height,
      scale_ratio: geometry.scale_ratio,
    }
  }
}

fn scaled(side: u32, ratio: f32) -> u32 {
  ((side as f32 * ratio).round() as u32).max(1)
}

/// 根据原始尺寸和缩放策略计算缩放后尺寸与缩放比例
pub fn plan(width: u32, height: u32, policy: &ResizePolicy) -> Geometry {
  match *policy {
    ResizePolicy::FixedCrop {
      crop_short_size,
      width: crop_w,
      height: crop_h,
    } => {
      let percent = crop_short_size as f32 / width.min(height).max(1) as f32;
      Geometry {
        resized_width: scaled(width, percent),
        resized_height: scaled(height, percent),
        scale_ratio: 1.0,
        crop: Some((crop_w, crop_h)),
      }
    }
    ResizePolicy::Unpadded {
      width: target_w,
      height: target_h,
    } => Geometry {
      resized_width: target_w,
      resized_height: target_h,
      scale_ratio: 1.0,
      crop: None,
    },
    ResizePolicy::RangeScaled {
      target_short_size,
      max_size,
    } => {
      let short = width.min(height).max(1) as f32;
      let long = width.max(height).max(1) as f32;
      let ratio = (target_short_size as f32 / short).min(max_size as f32 / long);
      Geometry {
        resized_width: scaled(width, ratio),
        resized_height: scaled(height, ratio),
        scale_ratio: ratio,
        crop: None,
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fixed_crop_scales_short_side() {
    let policy = ResizePolicy::FixedCrop {
      crop_short_size: 256,
      width: 224,
      height: 224,
    };
    let g = plan(640, 480, &policy);
    assert_eq!((g.resized_width, g.resized_height), (341, 256));
    assert_eq!(g.scale_ratio, 1.0);
    assert_eq!(g.tensor_size(), (224, 224));
  }

  #[test]
  fn unpadded_uses_target_directly() {
    let policy = ResizePolicy::Unpadded {
      width: 608,
      height: 320,
    };
    let g = plan(1000, 30, &policy);
    assert_eq!((g.resized_width, g.resized_height), (608, 320));
    assert_eq!(g.scale_ratio, 1.0);
    assert!(g.needs_resize(1000, 30));
    assert!(!g.needs_resize(608, 320));
  }

  #[test]
  fn range_scaled_limits_both_sides() {
    let policy = ResizePolicy::RangeScaled {
      target_short_size: 800,
      max_size: 1333,
    };
    for &(w, h) in &[(640, 480), (1920, 1080), (300, 2000), (800, 800), (5, 7)] {
      let g = plan(w, h, &policy);
      let long = w.max(h) as f32;
      let short = w.min(h) as f32;
      assert!(long * g.scale_ratio <= 1333.0 + 1e-2, "{}x{}", w, h);
      assert!(short * g.scale_ratio <= 800.0 + 1e-2, "{}x{}", w, h);
      // 比例取两个约束中较紧的那个
      let expected = (800.0 / short).min(1333.0 / long);
      assert!((g.scale_ratio - expected).abs() < 1e-6);
      assert!(g.resized_width.max(g.resized_height) <= 1333);
      assert!(g.resized_width.min(g.resized_height) <= 800);
    }
  }

  #[test]
  fn range_scaled_long_side_bound() {
    let policy = ResizePolicy::RangeScaled {
      target_short_size: 800,
      max_size: 1333,
    };
    let g = plan(1920, 1080, &policy);
    assert_eq!(g.resized_width, 1333);
    assert_eq!(g.resized_height, 750);
  }

  #[test]
  fn plan_is_deterministic() {
    let policy = ResizePolicy::RangeScaled {
      target_short_size: 608,
      max_size: 1024,
    };
    assert_eq!(plan(777, 333, &policy), plan(777, 333, &policy));
  }
}
