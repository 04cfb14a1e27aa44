// 该文件是 Shanan （山南西风） 项目的一部分。
// src/batch.rs - 批次组装
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
  ops::Range,
  path::{Path, PathBuf},
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
    mpsc::{self, RecvTimeoutError},
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
  config::ModelDescriptor,
  error::PipelineError,
  frame::NormalizedBuffer,
  geometry::{Geometry, GeometryMetadata},
  input::{self, ImageFile, Preprocessor},
};

/// 将 `total` 张图像按 `batch_size` 切分，只有最后一批可能不满
pub fn partition(total: usize, batch_size: usize) -> Vec<Range<usize>> {
  if batch_size == 0 {
    return Vec::new();
  }
  (0..total.div_ceil(batch_size))
    .map(|u| u * batch_size..((u + 1) * batch_size).min(total))
    .collect()
}

/// 预处理完成、可以交给张量组装的批次
#[derive(Debug)]
pub struct PreparedBatch {
  pub index: usize,
  pub paths: Vec<PathBuf>,
  pub buffer: NormalizedBuffer,
  pub geometry: Vec<GeometryMetadata>,
}

impl PreparedBatch {
  pub fn len(&self) -> usize {
    self.paths.len()
  }

  pub fn is_empty(&self) -> bool {
    self.paths.is_empty()
  }
}

type WorkerResult = Result<GeometryMetadata, PipelineError>;

/// 批次组装器：先并行读入文件并按文件头规划几何尺寸，再并行解码并写入预先分配的缓冲区
#[derive(Debug, Clone)]
pub struct BatchAssembler {
  preprocessor: Preprocessor,
  decode_timeout: Option<Duration>,
}

impl BatchAssembler {
  pub fn new(descriptor: Arc<ModelDescriptor>) -> Self {
    let decode_timeout = descriptor.decode_timeout();
    Self {
      preprocessor: Preprocessor::new(descriptor),
      decode_timeout,
    }
  }

  pub fn with_decode_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.decode_timeout = timeout;
    self
  }

  /// 依次组装每个批次；某一批失败不影响后续批次
  pub fn run<'a, P: AsRef<Path>>(
    &'a self,
    images: &'a [P],
    batch_size: usize,
  ) -> impl Iterator<Item = (Range<usize>, Result<PreparedBatch, PipelineError>)> + 'a {
    partition(images.len(), batch_size)
      .into_iter()
      .enumerate()
      .map(move |(index, range)| {
        let batch = self.assemble(index, &images[range.clone()], Vec::new());
        (range, batch)
      })
  }

  /// 组装一个批次，`scratch` 为可复用的缓冲区存储
  pub fn assemble<P: AsRef<Path>>(
    &self,
    index: usize,
    paths: &[P],
    scratch: Vec<f32>,
  ) -> Result<PreparedBatch, PipelineError> {
    let paths: Vec<PathBuf> = paths.iter().map(|p| p.as_ref().to_path_buf()).collect();
    if paths.is_empty() {
      return Err(PipelineError::shape("空批次"));
    }
    debug!("组装第 {} 批, 共 {} 张图像", index, paths.len());

    let now = Instant::now();
    let deadline = self.decode_timeout.map(|t| now + t);
    let files = self.read_all(&paths, deadline)?;
    let plans = self.plan(&files)?;

    let (width, height) = plans[0].tensor_size();
    let channels = self.preprocessor.descriptor().channels;
    let mut buffer = NormalizedBuffer::reuse(
      scratch,
      paths.len(),
      channels,
      height as usize,
      width as usize,
    );
    let geometry = self.fill(&files, &plans, &mut buffer, deadline)?;
    debug!("第 {} 批预处理耗时: {:.2?}", index, now.elapsed());

    Ok(PreparedBatch {
      index,
      paths,
      buffer,
      geometry,
    })
  }

  /// 第一遍：每张图像一个线程读入文件并解析文件头，受解码期限约束
  fn read_all(
    &self,
    paths: &[PathBuf],
    deadline: Option<Instant>,
  ) -> Result<Vec<ImageFile>, PipelineError> {
    let (tx, rx) = mpsc::channel::<(usize, Result<ImageFile, PipelineError>)>();
    for (i, path) in paths.iter().enumerate() {
      let tx = tx.clone();
      let path = path.clone();
      thread::Builder::new()
        .name(format!("read-{}", i))
        .spawn(move || {
          let _ = tx.send((i, input::read(&path)));
        })?;
    }
    drop(tx);

    let mut slots: Vec<Option<Result<ImageFile, PipelineError>>> =
      paths.iter().map(|_| None).collect();
    let mut received = 0;
    while received < paths.len() {
      let message = match deadline {
        Some(deadline) => rx.recv_timeout(deadline.saturating_duration_since(Instant::now())),
        None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
      };
      match message {
        Ok((i, result)) => {
          slots[i] = Some(result);
          received += 1;
        }
        Err(RecvTimeoutError::Timeout) => {
          let pending = first_pending(&slots);
          warn!("读取图像超时: {:?}", paths[pending]);
          return Err(self.timeout(&paths[pending]));
        }
        Err(RecvTimeoutError::Disconnected) => break,
      }
    }

    // 全部到齐后按下标顺序取第一个失败，与线程调度无关
    let mut files = Vec::with_capacity(paths.len());
    for (i, slot) in slots.into_iter().enumerate() {
      match slot {
        Some(Ok(file)) => files.push(file),
        Some(Err(e)) => {
          debug!("第 {} 张图像读取失败, 整批放弃", i);
          return Err(e);
        }
        None => {
          return Err(PipelineError::decode_failed(
            &paths[i],
            "读取线程异常退出",
          ));
        }
      }
    }
    Ok(files)
  }

  /// 按文件头尺寸规划几何，并保证批内张量尺寸一致
  fn plan(&self, files: &[ImageFile]) -> Result<Vec<Geometry>, PipelineError> {
    let plans: Vec<Geometry> = files
      .iter()
      .map(|f| self.preprocessor.plan(f.width, f.height))
      .collect();

    let expected = plans[0].tensor_size();
    for (i, geometry) in plans.iter().enumerate() {
      let actual = geometry.tensor_size();
      if actual != expected {
        warn!("第 {} 张图像缩放后尺寸 {:?} 与首张 {:?} 不一致", i, actual, expected);
        return Err(PipelineError::GeometryMismatch {
          index: i,
          expected,
          actual,
        });
      }
    }
    Ok(plans)
  }

  /// 第二遍：每个线程独占缓冲区中属于自己的一段，直接写入，无需加锁
  fn fill(
    &self,
    files: &[ImageFile],
    plans: &[Geometry],
    buffer: &mut NormalizedBuffer,
    deadline: Option<Instant>,
  ) -> Result<Vec<GeometryMetadata>, PipelineError> {
    let cancel = AtomicBool::new(false);
    let results = thread::scope(|s| -> Result<Vec<WorkerResult>, PipelineError> {
      let mut handles = Vec::with_capacity(files.len());
      for (i, ((file, geometry), slot)) in files
        .iter()
        .zip(plans)
        .zip(buffer.images_mut())
        .enumerate()
      {
        let preprocessor = &self.preprocessor;
        let cancel = &cancel;
        let handle = thread::Builder::new()
          .name(format!("preprocess-{}", i))
          .spawn_scoped(s, move || {
            let meta = preprocessor.process_into(file, geometry, slot, cancel)?;
            if deadline.is_some_and(|d| Instant::now() > d) {
              cancel.store(true, Ordering::Relaxed);
              return Err(self.timeout(&file.path));
            }
            Ok(meta)
          })?;
        handles.push(handle);
      }
      Ok(
        handles
          .into_iter()
          .zip(files)
          .map(|(handle, file)| {
            handle.join().unwrap_or_else(|_| {
              Err(PipelineError::decode_failed(
                &file.path,
                "预处理线程异常退出",
              ))
            })
          })
          .collect(),
      )
    })?;

    let mut geometry = Vec::with_capacity(results.len());
    let mut cancelled = false;
    for (i, result) in results.into_iter().enumerate() {
      match result {
        Ok(meta) => geometry.push(meta),
        Err(PipelineError::Cancelled) => cancelled = true,
        Err(e) => {
          debug!("第 {} 张图像预处理失败, 整批放弃", i);
          return Err(e);
        }
      }
    }
    if cancelled {
      return Err(PipelineError::Cancelled);
    }
    Ok(geometry)
  }

  fn timeout(&self, path: &Path) -> PipelineError {
    PipelineError::DecodeTimeout {
      path: path.to_path_buf(),
      timeout: self.decode_timeout.unwrap_or_default(),
    }
  }
}

fn first_pending<T>(slots: &[Option<T>]) -> usize {
  slots.iter().position(|s| s.is_none()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  fn descriptor(resize: &str, feeds_size: usize, batch_size: usize) -> Arc<ModelDescriptor> {
    let text = format!(
      r#"{{ "batch_size": {}, "mean": [0, 0, 0], "std": [1, 1, 1], "feeds_size": {}, "resize": {} }}"#,
      batch_size, feeds_size, resize
    );
    Arc::new(ModelDescriptor::from_json_str(&text).unwrap())
  }

  fn write_png(dir: &Path, name: &str, width: u32, height: u32, value: u8) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_pixel(width, height, Rgb([value, value, value]))
      .save(&path)
      .unwrap();
    path
  }

  #[test]
  fn partition_covers_every_image_once() {
    for total in 0..20 {
      for batch_size in 1..7 {
        let batches = partition(total, batch_size);
        assert_eq!(batches.len(), total.div_ceil(batch_size));
        assert_eq!(batches.iter().map(|r| r.len()).sum::<usize>(), total);
        for (i, range) in batches.iter().enumerate() {
          if i + 1 < batches.len() {
            assert_eq!(range.len(), batch_size);
          } else {
            assert!(range.len() <= batch_size && !range.is_empty());
          }
        }
      }
    }
    assert!(partition(5, 0).is_empty());
  }

  #[test]
  fn last_batch_takes_the_remainder() {
    assert_eq!(partition(10, 4), vec![0..4, 4..8, 8..10]);
    assert_eq!(partition(8, 4), vec![0..4, 4..8]);
  }

  #[test]
  fn results_keep_image_order() {
    let dir = tempfile::tempdir().unwrap();
    let paths: Vec<PathBuf> = (0..4)
      .map(|i| write_png(dir.path(), &format!("{}.png", i), 6 + i, 4, (i * 50) as u8))
      .collect();
    let assembler = BatchAssembler::new(descriptor(
      r#"{ "resize_type": "unpadded", "width": 3, "height": 2 }"#,
      2,
      4,
    ));
    let batch = assembler.assemble(0, &paths, Vec::new()).unwrap();
    assert_eq!(batch.buffer.shape(), [4, 3, 2, 3]);
    for i in 0..4 {
      assert_eq!(batch.geometry[i].original_width, 6 + i as u32);
      let expected = (i * 50) as f32 / 255.0;
      let image = batch.buffer.image(i).unwrap();
      assert!(image.iter().all(|v| (v - expected).abs() < 1e-3), "image {}", i);
    }
  }

  #[test]
  fn failing_image_fails_whole_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut paths: Vec<PathBuf> = (0..8)
      .map(|i| write_png(dir.path(), &format!("{}.png", i), 4, 4, 10))
      .collect();
    let broken = dir.path().join("broken.png");
    std::fs::write(&broken, b"not an image").unwrap();
    paths[5] = broken.clone();

    let assembler = BatchAssembler::new(descriptor(
      r#"{ "resize_type": "unpadded", "width": 4, "height": 4 }"#,
      2,
      8,
    ));
    for _ in 0..5 {
      let err = assembler.assemble(0, &paths, Vec::new()).unwrap_err();
      match err {
        PipelineError::DecodeFailed { path, .. } => assert_eq!(path, broken),
        other => panic!("unexpected error: {:?}", other),
      }
    }
  }

  #[test]
  fn range_scaled_batch_needs_uniform_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let paths = vec![
      write_png(dir.path(), "a.png", 8, 4, 0),
      write_png(dir.path(), "b.png", 4, 8, 0),
    ];
    let assembler = BatchAssembler::new(descriptor(
      r#"{ "resize_type": "range_scaled", "target_short_size": 4, "max_size": 8 }"#,
      3,
      2,
    ));
    let err = assembler.assemble(0, &paths, Vec::new()).unwrap_err();
    assert!(matches!(err, PipelineError::GeometryMismatch { index: 1, .. }));
  }

  #[test]
  fn run_isolates_failed_batches() {
    let dir = tempfile::tempdir().unwrap();
    let mut paths: Vec<PathBuf> = (0..5)
      .map(|i| write_png(dir.path(), &format!("{}.png", i), 4, 4, 0))
      .collect();
    paths[1] = dir.path().join("missing.png");
    let assembler = BatchAssembler::new(descriptor(
      r#"{ "resize_type": "unpadded", "width": 2, "height": 2 }"#,
      2,
      2,
    ));
    let outcomes: Vec<_> = assembler.run(&paths, 2).collect();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].1.is_err());
    assert!(outcomes[1].1.is_ok());
    let last = outcomes[2].1.as_ref().unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(outcomes[2].0, 4..5);
  }

  #[cfg(unix)]
  #[test]
  fn blocked_read_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("hung.png");
    let status = std::process::Command::new("mkfifo")
      .arg(&fifo)
      .status()
      .unwrap();
    assert!(status.success());
    let ready = write_png(dir.path(), "ready.png", 4, 4, 0);

    let assembler = BatchAssembler::new(descriptor(
      r#"{ "resize_type": "unpadded", "width": 4, "height": 4 }"#,
      2,
      2,
    ))
    .with_decode_timeout(Some(Duration::from_millis(100)));

    // 没有写端时打开 FIFO 会一直阻塞
    let started = Instant::now();
    let err = assembler
      .assemble(0, &[ready, fifo.clone()], Vec::new())
      .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    match err {
      PipelineError::DecodeTimeout { path, timeout } => {
        assert_eq!(path, fifo);
        assert_eq!(timeout, Duration::from_millis(100));
      }
      other => panic!("unexpected error: {:?}", other),
    }
  }

  #[test]
  fn workers_fill_reused_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let paths = vec![
      write_png(dir.path(), "a.png", 4, 4, 255),
      write_png(dir.path(), "b.png", 4, 4, 0),
    ];
    let assembler = BatchAssembler::new(descriptor(
      r#"{ "resize_type": "unpadded", "width": 2, "height": 2 }"#,
      2,
      2,
    ))
    .with_decode_timeout(Some(Duration::from_secs(30)));
    let scratch = vec![7.0f32; 1024];
    let batch = assembler.assemble(0, &paths, scratch).unwrap();
    assert_eq!(batch.buffer.shape(), [2, 3, 2, 2]);
    assert!(batch.buffer.image(0).unwrap().iter().all(|v| (v - 1.0).abs() < 1e-6));
    assert!(batch.buffer.image(1).unwrap().iter().all(|v| *v == 0.0));
  }
}
