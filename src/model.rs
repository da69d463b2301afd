// 该文件是 Grounded-SAM 项目的一部分。
// src/model.rs - 模型
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

use ndarray::Array2;

use crate::{
  boxes::{CxCyWh, ResizeLongestSide, XyXy, to_pixel_xyxy},
  frame::RgbFrame,
};

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 开放词汇检测器
pub trait Detect {
  type Error;

  fn detect(
    &mut self,
    frame: &RgbFrame,
    caption: &str,
    thresholds: &Thresholds,
  ) -> Result<DetectResult, Self::Error>;
}

/// 以框为提示的分割模型
pub trait Segment {
  type Error;

  /// 框坐标从原图像素空间到模型输入空间的变换
  fn transform(&self) -> ResizeLongestSide {
    ResizeLongestSide::default()
  }

  fn set_image(&mut self, frame: &RgbFrame) -> Result<(), Self::Error>;

  /// `boxes` 已经过 [`Segment::transform`] 变换；每个框返回一组候选掩码
  fn predict_boxes(&mut self, boxes: &[XyXy], multimask: bool) -> Result<Vec<MaskSet>, Self::Error>;
}

/// 检测阈值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
  pub box_threshold: f32,
  pub text_threshold: f32,
}

impl Default for Thresholds {
  fn default() -> Self {
    Self {
      box_threshold: 0.3,
      text_threshold: 0.25,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
  /// 归一化中心点框
  pub bbox: CxCyWh,
  pub score: f32,
  /// 从提示词中提取的短语
  pub phrase: String,
}

#[derive(Debug, Clone, Default)]
pub struct DetectResult {
  pub items: Box<[Detection]>,
}

impl DetectResult {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// 所有检测框在 `width x height` 图像上的像素角点坐标
  pub fn pixel_boxes(&self, width: u32, height: u32) -> Vec<XyXy> {
    self
      .items
      .iter()
      .map(|d| to_pixel_xyxy(d.bbox, width, height))
      .collect()
  }
}

impl From<Vec<Detection>> for DetectResult {
  fn from(items: Vec<Detection>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 二值掩码，形状为 `(高, 宽)`
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
  data: Array2<bool>,
}

impl From<Array2<bool>> for Mask {
  fn from(data: Array2<bool>) -> Self {
    Self { data }
  }
}

impl Mask {
  pub fn empty(height: usize, width: usize) -> Self {
    Self {
      data: Array2::from_elem((height, width), false),
    }
  }

  pub fn height(&self) -> usize {
    self.data.nrows()
  }

  pub fn width(&self) -> usize {
    self.data.ncols()
  }

  pub fn get(&self, x: usize, y: usize) -> bool {
    self.data[[y, x]]
  }

  /// 前景像素数量
  pub fn area(&self) -> usize {
    self.data.iter().filter(|v| **v).count()
  }

  pub fn as_array(&self) -> &Array2<bool> {
    &self.data
  }
}

/// 单个框的候选掩码，按模型输出顺序排列
#[derive(Debug, Clone, Default)]
pub struct MaskSet {
  pub masks: Vec<Mask>,
  /// 模型预测的 IoU，仅用于日志
  pub scores: Vec<f32>,
}

impl MaskSet {
  pub fn len(&self) -> usize {
    self.masks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.masks.is_empty()
  }
}

/// 检测 + 分割的完整结果，`masks[i]` 对应 `detections.items[i]`
#[derive(Debug, Clone, Default)]
pub struct GroundedResult {
  pub detections: DetectResult,
  pub masks: Vec<MaskSet>,
}

impl GroundedResult {
  /// 所有 (检测, 候选掩码) 组合的数量
  pub fn mask_count(&self) -> usize {
    self.masks.iter().map(MaskSet::len).sum()
  }
}

mod grounding_dino;
pub mod hub;
mod pipeline;
mod sam;
pub mod session;

pub use self::grounding_dino::{
  DEFAULT_DETECTOR_CONFIG, DEFAULT_DETECTOR_REPO, DEFAULT_DETECTOR_TOKENIZER,
  DEFAULT_DETECTOR_WEIGHTS, DetectorError, DetectorSource, DetectorSpec, GroundingDino,
  GroundingDinoBuilder,
};
pub use self::pipeline::{GroundedSam, PipelineError};
pub use self::sam::{SamBuilder, SamError, SamPredictor};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn pixel_boxes_follow_detection_order() {
    let result = DetectResult::from(vec![
      Detection {
        bbox: CxCyWh::new(0.5, 0.5, 1.0, 1.0),
        score: 0.9,
        phrase: "curb".into(),
      },
      Detection {
        bbox: CxCyWh::new(0.25, 0.25, 0.5, 0.5),
        score: 0.4,
        phrase: "curb".into(),
      },
    ]);
    let boxes = result.pixel_boxes(640, 480);
    assert_eq!(boxes[0], XyXy::new(0.0, 0.0, 640.0, 480.0));
    assert_eq!(boxes[1], XyXy::new(0.0, 0.0, 320.0, 240.0));
  }

  #[test]
  fn mask_area_and_shape() {
    let mut data = Array2::from_elem((480, 640), false);
    data[[10, 20]] = true;
    data[[479, 639]] = true;
    let mask = Mask::from(data);
    assert_eq!((mask.height(), mask.width()), (480, 640));
    assert_eq!(mask.area(), 2);
    assert!(mask.get(20, 10));
    assert!(!mask.get(10, 20));
  }
}
