// 该文件是 Grounded-SAM 项目的一部分。
// src/model/pipeline.rs - 检测 + 分割流水线
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

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl,
  config::PipelineConfig,
  frame::RgbFrame,
  model::{
    Detect, GroundedResult, Model, Segment, Thresholds,
    grounding_dino::{DetectorError, DetectorSource, GroundingDino, GroundingDinoBuilder},
    sam::{SamBuilder, SamError, SamPredictor},
  },
  utils::parse_url_or_path,
};

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("检测失败: {0}")]
  Detect(#[source] BoxedError),
  #[error("分割失败: {0}")]
  Segment(#[source] BoxedError),
  #[error("检测数量 {detections} 与掩码组数量 {masks} 不一致")]
  Mismatch { detections: usize, masks: usize },
}

/// 先用开放词汇检测器定位，再用框提示分割模型生成掩码
pub struct GroundedSam<D, S> {
  detector: D,
  segmenter: S,
  caption: String,
  thresholds: Thresholds,
  multimask: bool,
}

impl<D, S> GroundedSam<D, S> {
  pub fn new(detector: D, segmenter: S, caption: &str) -> Self {
    Self {
      detector,
      segmenter,
      caption: caption.to_string(),
      thresholds: Thresholds::default(),
      multimask: true,
    }
  }

  pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
    self.thresholds = thresholds;
    self
  }

  pub fn with_multimask(mut self, multimask: bool) -> Self {
    self.multimask = multimask;
    self
  }

  pub fn caption(&self) -> &str {
    &self.caption
  }
}

impl GroundedSam<GroundingDino, SamPredictor> {
  /// 按配置下载并加载两个模型
  pub fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
    let detector = detector_builder(config)
      .and_then(|b| {
        b.cache_dir(config.cache_dir.clone())
          .device(config.device)
          .policy(config.detector_policy)
          .num_threads(config.num_threads)
          .build()
      })
      .map_err(|e: DetectorError| anyhow::anyhow!(e).context("无法加载检测器"))?;

    let sam_url = parse_url_or_path(&config.sam_checkpoint, "sam")?;
    let segmenter = SamBuilder::from_url(&sam_url)
      .and_then(|b| {
        b.device(config.device)
          .policy(config.sam_policy)
          .num_threads(config.num_threads)
          .build()
      })
      .map_err(|e: SamError| anyhow::anyhow!(e).context("无法加载 SAM"))?;

    Ok(
      GroundedSam::new(detector, segmenter, &config.prompt)
        .with_thresholds(config.thresholds)
        .with_multimask(config.multimask),
    )
  }
}

/// `detector_repo` 为 `hf://` 或 `file://` URL 时由 URL 决定来源和文件名，
/// 否则视为仓库 id
fn detector_builder(config: &PipelineConfig) -> Result<GroundingDinoBuilder, DetectorError> {
  match Url::parse(&config.detector_repo) {
    Ok(url) if url.scheme().len() > 1 => GroundingDinoBuilder::from_url(&url),
    _ => Ok(
      GroundingDinoBuilder::new(DetectorSource::Hub {
        repo: config.detector_repo.clone(),
        revision: config.detector_revision.clone(),
        cache_dir: None,
      })
      .files(
        &config.detector_weights,
        &config.detector_config,
        &config.detector_tokenizer,
      ),
    ),
  }
}

impl<D, S> Model for GroundedSam<D, S>
where
  D: Detect,
  D::Error: std::error::Error + Send + Sync + 'static,
  S: Segment,
  S::Error: std::error::Error + Send + Sync + 'static,
{
  type Input = RgbFrame;
  type Output = GroundedResult;
  type Error = PipelineError;

  fn infer(&mut self, frame: &Self::Input) -> Result<Self::Output, Self::Error> {
    let now = std::time::Instant::now();
    let detections = self
      .detector
      .detect(frame, &self.caption, &self.thresholds)
      .map_err(|e| PipelineError::Detect(Box::new(e)))?;
    info!("检测耗时: {:.2?}", now.elapsed());
    for (i, d) in detections.items.iter().enumerate() {
      debug!("检测 {}: {:?} {:.3} {}", i, d.bbox, d.score, d.phrase);
    }

    let now = std::time::Instant::now();
    self
      .segmenter
      .set_image(frame)
      .map_err(|e| PipelineError::Segment(Box::new(e)))?;

    let (width, height) = (frame.width(), frame.height());
    let boxes = detections.pixel_boxes(width, height);
    let boxes = self.segmenter.transform().apply_boxes(&boxes, height, width);
    let masks = self
      .segmenter
      .predict_boxes(&boxes, self.multimask)
      .map_err(|e| PipelineError::Segment(Box::new(e)))?;
    info!("分割耗时: {:.2?}", now.elapsed());

    if masks.len() != detections.len() {
      return Err(PipelineError::Mismatch {
        detections: detections.len(),
        masks: masks.len(),
      });
    }

    for (i, (d, set)) in detections.items.iter().zip(&masks).enumerate() {
      let areas: Vec<usize> = set.masks.iter().map(|m| m.area()).collect();
      info!(
        "目标 {} [{} {:.2}]: {} 个候选掩码，面积 {:?}，IoU {:?}",
        i,
        d.phrase,
        d.score,
        set.len(),
        areas,
        set.scores
      );
    }

    Ok(GroundedResult { detections, masks })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    boxes::{CxCyWh, XyXy},
    model::{DetectResult, Detection, Mask, MaskSet},
  };

  #[derive(Debug, Error)]
  #[error("fake")]
  struct FakeError;

  struct OneBox;

  impl Detect for OneBox {
    type Error = FakeError;

    fn detect(&mut self, _: &RgbFrame, _: &str, _: &Thresholds) -> Result<DetectResult, FakeError> {
      Ok(DetectResult::from(vec![Detection {
        bbox: CxCyWh::new(0.5, 0.5, 1.0, 1.0),
        score: 0.5,
        phrase: "curb".into(),
      }]))
    }
  }

  /// 记录收到的框，但不返回任何掩码组
  #[derive(Default)]
  struct Forgetful {
    seen: Vec<XyXy>,
  }

  impl Segment for Forgetful {
    type Error = FakeError;

    fn set_image(&mut self, _: &RgbFrame) -> Result<(), FakeError> {
      Ok(())
    }

    fn predict_boxes(&mut self, boxes: &[XyXy], _: bool) -> Result<Vec<MaskSet>, FakeError> {
      self.seen.extend_from_slice(boxes);
      Ok(Vec::new())
    }
  }

  #[test]
  fn boxes_reach_segmenter_in_model_space() {
    let frame = RgbFrame::from(image::RgbImage::new(640, 480));
    let mut pipeline = GroundedSam::new(OneBox, Forgetful::default(), "curb");
    let err = pipeline.infer(&frame).unwrap_err();
    assert!(matches!(
      err,
      PipelineError::Mismatch {
        detections: 1,
        masks: 0
      }
    ));
    assert_eq!(pipeline.segmenter.seen, vec![XyXy::new(0.0, 0.0, 1024.0, 768.0)]);
  }

  struct Failing;

  impl Segment for Failing {
    type Error = FakeError;

    fn set_image(&mut self, _: &RgbFrame) -> Result<(), FakeError> {
      Err(FakeError)
    }

    fn predict_boxes(&mut self, _: &[XyXy], _: bool) -> Result<Vec<MaskSet>, FakeError> {
      Ok(vec![MaskSet {
        masks: vec![Mask::empty(1, 1)],
        scores: vec![1.0],
      }])
    }
  }

  #[test]
  fn segmenter_errors_are_wrapped() {
    let frame = RgbFrame::from(image::RgbImage::new(4, 4));
    let mut pipeline = GroundedSam::new(OneBox, Failing, "curb");
    assert!(matches!(
      pipeline.infer(&frame),
      Err(PipelineError::Segment(_))
    ));
  }

  #[test]
  fn detector_location_accepts_urls() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
      detector_repo: format!("file://{}", dir.path().display()),
      ..PipelineConfig::default()
    };
    let builder = detector_builder(&config).unwrap();
    assert!(matches!(builder.build(), Err(DetectorError::NotFound(_))));

    let config = PipelineConfig {
      detector_repo: "ftp://models/gdino".to_string(),
      ..PipelineConfig::default()
    };
    assert!(matches!(
      detector_builder(&config),
      Err(DetectorError::SchemeMismatch(_))
    ));

    assert!(detector_builder(&PipelineConfig::default()).is_ok());
  }
}
