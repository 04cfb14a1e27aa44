// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/batch_predict.rs - 批量推理命令行
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
  path::PathBuf,
  sync::{Arc, atomic::Ordering},
};

use anyhow::{Result, bail};
use clap::Parser;
use url::Url;

use shanan_batch::{
  FromUrl, ModelDescriptor,
  config::ExecutionMode,
  engine::{InferenceEngine, LegacyEngine, ReplayBackend, ZeroCopyEngine},
  input,
  output::OutputWrapper,
  task::Predictor,
};
use tracing::{info, warn};

/// 批量图像推理参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型配置文件, 例如 model:///models/yolo/model.json
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 推理引擎, 例如 replay:///records/yolo.json
  #[arg(long, value_name = "ENGINE")]
  pub engine: Url,
  /// 输出路径, 默认打印到日志
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
  /// 覆盖配置中的批大小
  #[arg(long, value_name = "BATCH_SIZE")]
  pub batch_size: Option<usize>,
  /// 图像文件或目录
  #[arg(required = true, value_name = "IMAGES")]
  pub images: Vec<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型配置路径: {}", args.model);
  info!("推理引擎: {}", args.engine);

  let descriptor = Arc::new(ModelDescriptor::from_url(&args.model)?);
  let backend = ReplayBackend::from_url(&args.engine)?;
  let engine: Box<dyn InferenceEngine> = match descriptor.predictor_mode {
    ExecutionMode::Legacy => Box::new(LegacyEngine::new(backend)),
    ExecutionMode::ZeroCopy => Box::new(ZeroCopyEngine::new(backend)),
  };
  let output = match &args.output {
    Some(url) => {
      info!("输出路径: {}", url);
      OutputWrapper::from_url(url)?
    }
    None => OutputWrapper::default(),
  };

  let images = input::collect_images(&args.images)?;
  if images.is_empty() {
    bail!("没有找到输入图像");
  }

  let mut predictor = Predictor::new(descriptor, engine)?;
  if let Some(batch_size) = args.batch_size {
    if batch_size == 0 {
      bail!("批大小必须大于 0");
    }
    predictor = predictor.with_batch_size(batch_size);
  }

  let stop = predictor.stop_flag();
  ctrlc::set_handler(move || {
    warn!("收到中断信号, 当前批次完成后退出...");
    stop.store(true, Ordering::Relaxed);
  })?;

  let summary = predictor.run(&images, &output)?;
  info!(
    "共 {} 批, 成功 {} 批 ({} 张图像), 失败 {} 批",
    summary.batches,
    summary.succeeded,
    summary.images,
    summary.failed_batches()
  );
  for (kind, count) in &summary.failed {
    warn!("  {}: {} 批", kind, count);
  }
  if summary.stopped {
    warn!("任务被中断");
  }

  Ok(())
}
