// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 批量推理任务
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
  collections::BTreeMap,
  convert::Infallible,
  path::PathBuf,
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::Instant,
};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
  batch::{BatchAssembler, PreparedBatch, partition},
  config::{ModelDescriptor, TaskKind},
  engine::InferenceEngine,
  error::{ErrorKind, PipelineError},
  geometry::GeometryMetadata,
  model::{BatchResults, Classifier, Detector, Model},
  output::Render,
  tensor::TensorMarshaler,
};

/// 单个批次的处理结果
#[derive(Debug)]
pub struct BatchReport {
  pub index: usize,
  pub images: Vec<PathBuf>,
  /// 组装失败时为空
  pub geometry: Vec<GeometryMetadata>,
  pub outcome: Result<BatchResults, PipelineError>,
}

impl BatchReport {
  pub fn is_ok(&self) -> bool {
    self.outcome.is_ok()
  }

  pub fn kind(&self) -> Option<ErrorKind> {
    self.outcome.as_ref().err().map(PipelineError::kind)
  }
}

/// 整次运行的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
  pub batches: usize,
  pub succeeded: usize,
  pub images: usize,
  pub failed: BTreeMap<ErrorKind, usize>,
  /// 收到停止信号后提前结束
  pub stopped: bool,
}

impl RunSummary {
  pub fn record(&mut self, report: &BatchReport) {
    self.batches += 1;
    match report.kind() {
      None => {
        self.succeeded += 1;
        self.images += report.images.len();
      }
      Some(kind) => *self.failed.entry(kind).or_default() += 1,
    }
  }

  pub fn failed_batches(&self) -> usize {
    self.failed.values().sum()
  }
}

/// 批量推理驱动：切分批次，组装张量，调用引擎并解码输出
pub struct Predictor<E> {
  descriptor: Arc<ModelDescriptor>,
  assembler: BatchAssembler,
  marshaler: TensorMarshaler,
  feed_names: Vec<String>,
  engine: E,
  batch_size: usize,
  stop: Arc<AtomicBool>,
  scratch: Vec<f32>,
}

impl<E: InferenceEngine> Predictor<E> {
  /// 初始化时绑定一次输入名称；执行模式或输入数量不符视为配置错误
  pub fn new(descriptor: Arc<ModelDescriptor>, engine: E) -> Result<Self, PipelineError> {
    descriptor.validate()?;
    if descriptor.predictor_mode != engine.mode() {
      error!(
        "配置的推理模式 {:?} 与引擎 {:?} 不一致",
        descriptor.predictor_mode,
        engine.mode()
      );
      return Err(PipelineError::ConfigInvalid(format!(
        "推理模式不一致: 配置为 {:?}, 引擎为 {:?}",
        descriptor.predictor_mode,
        engine.mode()
      )));
    }
    let marshaler = TensorMarshaler::new(&descriptor);
    let feed_names = engine.bind_feeds(marshaler.roles()).map_err(|e| {
      error!("输入绑定失败: {}", e);
      PipelineError::ConfigInvalid(format!("输入绑定失败: {}", e))
    })?;
    info!(
      "推理模式 {:?}, 输入: {:?}, 批大小 {}",
      engine.mode(),
      feed_names,
      descriptor.batch_size
    );

    Ok(Self {
      assembler: BatchAssembler::new(descriptor.clone()),
      batch_size: descriptor.batch_size,
      descriptor,
      marshaler,
      feed_names,
      engine,
      stop: Arc::new(AtomicBool::new(false)),
      scratch: Vec::new(),
    })
  }

  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size.max(1);
    self
  }

  pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = stop;
    self
  }

  pub fn stop_flag(&self) -> Arc<AtomicBool> {
    self.stop.clone()
  }

  pub fn batch_size(&self) -> usize {
    self.batch_size
  }

  pub fn feed_names(&self) -> &[String] {
    &self.feed_names
  }

  pub fn engine(&self) -> &E {
    &self.engine
  }

  /// 处理全部图像并返回逐批次报告
  pub fn predict(&mut self, images: &[PathBuf]) -> (Vec<BatchReport>, RunSummary) {
    let mut reports = Vec::new();
    let Ok(summary) = self.for_each_batch(images, |report| {
      reports.push(report);
      Ok::<_, Infallible>(())
    });
    (reports, summary)
  }

  /// 处理全部图像，每个批次完成后交给输出渲染
  pub fn run<R: Render>(&mut self, images: &[PathBuf], output: &R) -> Result<RunSummary, R::Error> {
    self.for_each_batch(images, |report| output.render_result(&report))
  }

  fn for_each_batch<SinkError>(
    &mut self,
    images: &[PathBuf],
    mut sink: impl FnMut(BatchReport) -> Result<(), SinkError>,
  ) -> Result<RunSummary, SinkError> {
    let batches = partition(images.len(), self.batch_size);
    info!("共 {} 张图像, 分为 {} 批", images.len(), batches.len());

    let mut summary = RunSummary::default();
    let started = Instant::now();
    for (index, range) in batches.into_iter().enumerate() {
      if self.stop.load(Ordering::Relaxed) {
        warn!("收到停止信号, 在第 {} 批之前退出", index);
        summary.stopped = true;
        break;
      }
      let report = self.predict_batch(index, &images[range]);
      summary.record(&report);
      sink(report)?;
    }

    info!(
      "任务完成, 成功 {} 批, 失败 {} 批, 耗时: {:.2?}",
      summary.succeeded,
      summary.failed_batches(),
      started.elapsed()
    );
    Ok(summary)
  }

  /// 处理一个批次；任何失败只影响本批次
  pub fn predict_batch(&mut self, index: usize, paths: &[PathBuf]) -> BatchReport {
    info!("开始第 {} 批, {} 张图像", index, paths.len());
    let scratch = std::mem::take(&mut self.scratch);
    let (outcome, geometry) = match self.assembler.assemble(index, paths, scratch) {
      Ok(prepared) => {
        let outcome = self.invoke(&prepared);
        let PreparedBatch {
          buffer, geometry, ..
        } = prepared;
        self.scratch = buffer.into_vec();
        (outcome, geometry)
      }
      Err(e) => (Err(e), Vec::new()),
    };

    if let Err(e) = &outcome {
      error!("第 {} 批失败 [{}]: {}", index, e.kind(), e);
    }
    BatchReport {
      index,
      images: paths.to_vec(),
      geometry,
      outcome,
    }
  }

  fn invoke(&mut self, prepared: &PreparedBatch) -> Result<BatchResults, PipelineError> {
    let batch_size = prepared.len();
    let feeds = self.marshaler.marshal(&prepared.buffer, &prepared.geometry)?;
    let tensors = feeds.tensors(self.marshaler.roles(), &self.feed_names);
    for tensor in &tensors {
      debug!(
        "输入 {}: {:?} {:?}",
        tensor.name,
        tensor.shape,
        tensor.dtype()
      );
    }

    let now = Instant::now();
    let raw = self.engine.infer(&tensors, batch_size)?;
    debug!("推理耗时: {:.2?}", now.elapsed());
    debug!("输出形状: {:?}", raw.shape);

    let results = match self.descriptor.task() {
      TaskKind::Classification => {
        BatchResults::Classification(Classifier.postprocess(&raw, batch_size)?)
      }
      TaskKind::Detection => BatchResults::Detection(Detector.postprocess(&raw, batch_size)?),
    };
    if results.len() != batch_size {
      return Err(PipelineError::shape(format!(
        "解码得到 {} 个结果, 批大小为 {}",
        results.len(),
        batch_size
      )));
    }
    Ok(results)
  }
}
