// 该文件是 Grounded-SAM 项目的一部分。
// src/output/draw.rs - 检测框与掩码可视化
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
  cell::RefCell,
  fmt,
  path::Path,
  str::FromStr,
};

use ab_glyph::{FontArc, PxScale};
use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage, imageops};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, warn};

use crate::{
  frame::RgbFrame,
  model::{DetectResult, GroundedResult, Mask},
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_TEXT_PADDING: i32 = 2;
const LABEL_COLOR: [u8; 3] = [0, 255, 0];
const BOX_THICKNESS: i32 = 2;

const RANDOM_MASK_ALPHA: f32 = 0.8;
/// 固定掩码颜色 (30, 144, 255)，透明度 0.6
pub const FIXED_MASK_COLOR: [f32; 4] = [30.0 / 255.0, 144.0 / 255.0, 1.0, 0.6];

const EMBEDDED_FONT: &[u8] = include_bytes!("../../assets/font.ttf"); // DejaVu Sans

/// 掩码着色方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskColor {
  /// 每个掩码随机 RGB，透明度 0.8
  #[default]
  Random,
  /// 固定蓝色，透明度 0.6
  Fixed,
}

impl FromStr for MaskColor {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "random" => Ok(MaskColor::Random),
      "fixed" => Ok(MaskColor::Fixed),
      other => Err(format!("未知掩码颜色: {}，可选值为 random 或 fixed", other)),
    }
  }
}

impl fmt::Display for MaskColor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MaskColor::Random => write!(f, "random"),
      MaskColor::Fixed => write!(f, "fixed"),
    }
  }
}

/// 依次给出每个掩码的 RGBA 颜色（分量范围 0..=1）
pub struct ColorPicker {
  mode: MaskColor,
  rng: RefCell<StdRng>,
}

impl ColorPicker {
  pub fn new(mode: MaskColor, seed: Option<u64>) -> Self {
    let rng = match seed {
      Some(seed) => StdRng::seed_from_u64(seed),
      None => StdRng::from_entropy(),
    };
    Self {
      mode,
      rng: RefCell::new(rng),
    }
  }

  pub fn next_color(&self) -> [f32; 4] {
    match self.mode {
      MaskColor::Fixed => FIXED_MASK_COLOR,
      MaskColor::Random => {
        let mut rng = self.rng.borrow_mut();
        [rng.r#gen(), rng.r#gen(), rng.r#gen(), RANDOM_MASK_ALPHA]
      }
    }
  }
}

fn to_u8(v: f32) -> u8 {
  (v.clamp(0.0, 1.0) * 255.0) as u8
}

/// 掩码图层：前景像素为 `color`，背景完全透明
pub fn mask_layer(mask: &Mask, color: [f32; 4]) -> RgbaImage {
  let pixel = Rgba(color.map(to_u8));
  let transparent = Rgba([0, 0, 0, 0]);
  RgbaImage::from_fn(mask.width() as u32, mask.height() as u32, |x, y| {
    if mask.get(x as usize, y as usize) {
      pixel
    } else {
      transparent
    }
  })
}

/// 把底图转为 RGBA，再将掩码图层按透明度叠加上去
pub fn show_mask(mask: &Mask, base: &RgbImage, color: [f32; 4]) -> RgbaImage {
  if (mask.width() as u32, mask.height() as u32) != base.dimensions() {
    warn!(
      "掩码尺寸 {}x{} 与图像尺寸 {}x{} 不一致",
      mask.width(),
      mask.height(),
      base.width(),
      base.height()
    );
  }
  let mut composed = DynamicImage::ImageRgb8(base.clone()).to_rgba8();
  imageops::overlay(&mut composed, &mask_layer(mask, color), 0, 0);
  composed
}

/// 加载标签字体：优先使用配置的文件，失败时回退到嵌入的字体
pub fn load_font(path: Option<&Path>) -> FontArc {
  if let Some(path) = path {
    match std::fs::read(path).map(FontArc::try_from_vec) {
      Ok(Ok(font)) => {
        debug!("使用字体: {}", path.display());
        return font;
      }
      Ok(Err(e)) => warn!("无法解析字体 {}: {}，使用内置字体", path.display(), e),
      Err(e) => warn!("无法读取字体 {}: {}，使用内置字体", path.display(), e),
    }
  }
  FontArc::try_from_slice(EMBEDDED_FONT).expect("无法加载嵌入的字体文件")
}

/// 单个 (检测, 候选掩码) 的叠加结果
pub struct Overlay {
  pub detection: usize,
  pub candidate: usize,
  pub image: RgbaImage,
}

impl Overlay {
  /// 文件名后缀，例如 `_0_2`
  pub fn suffix(&self) -> String {
    format!("_{}_{}", self.detection, self.candidate)
  }
}

pub struct Draw {
  font_size: f32,
  label_text_height: i32,
  label_color: [u8; 3],
  font: FontArc,
  colors: ColorPicker,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(MaskColor::default(), None, None)
  }
}

impl Draw {
  pub fn new(mask_color: MaskColor, seed: Option<u64>, font: Option<&Path>) -> Self {
    Self {
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_color: LABEL_COLOR,
      font: load_font(font),
      colors: ColorPicker::new(mask_color, seed),
    }
  }

  // bbox 为像素坐标 [x1, y1, x2, y2]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: [f32; 4], label: &str) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = Rgb(self.label_color);
    for t in 0..BOX_THICKNESS {
      let width = x_max - x_min - 2 * t;
      let height = y_max - y_min - 2 * t;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32 + 1, height as u32 + 1);
      draw_hollow_rect_mut(image, rect, color);
    }

    let scale = PxScale::from(self.font_size);
    let text_width = text_size(scale, &self.font, label).0 as i32;
    let label_x = x_min;
    let label_y = (y_min - self.label_text_height).max(0);
    let label_width = (text_width + 2 * LABEL_TEXT_PADDING).min(w - label_x);
    if label_width <= 0 {
      return;
    }

    let rect = Rect::at(label_x, label_y).of_size(label_width as u32, self.label_text_height as u32);
    draw_filled_rect_mut(image, rect, color);
    draw_text_mut(
      image,
      Rgb([0, 0, 0]),
      label_x + LABEL_TEXT_PADDING,
      label_y + LABEL_TEXT_PADDING,
      scale,
      &self.font,
      label,
    );
  }

  /// 在原图上绘制所有检测框和 `短语 分数` 标签
  pub fn annotate(&self, frame: &RgbFrame, detections: &DetectResult) -> RgbImage {
    let mut image = frame.image().clone();
    let boxes = detections.pixel_boxes(frame.width(), frame.height());
    for (d, b) in detections.items.iter().zip(boxes) {
      let label = format!("{} {:.2}", d.phrase, d.score);
      self.draw_bbox_with_label(&mut image, b.as_array(), &label);
    }
    image
  }

  /// 每个 (检测, 候选掩码) 各生成一张叠加图
  pub fn overlays(&self, annotated: &RgbImage, result: &GroundedResult) -> Vec<Overlay> {
    let mut overlays = Vec::with_capacity(result.mask_count());
    for (i, set) in result.masks.iter().enumerate() {
      for (j, mask) in set.masks.iter().enumerate() {
        let color = self.colors.next_color();
        debug!("叠加掩码 ({}, {})，面积 {}，颜色 {:?}", i, j, mask.area(), color);
        overlays.push(Overlay {
          detection: i,
          candidate: j,
          image: show_mask(mask, annotated, color),
        });
      }
    }
    overlays
  }
}

/// 检测结果的文本记录
pub struct Record {
  /// 输出像素角点坐标，否则输出归一化中心点坐标
  pub pixel_boxes: bool,
}

impl Record {
  pub fn lines(&self, frame: &RgbFrame, result: &GroundedResult) -> Vec<String> {
    let boxes = result.detections.pixel_boxes(frame.width(), frame.height());
    result
      .detections
      .items
      .iter()
      .zip(boxes)
      .enumerate()
      .map(|(i, (d, pixel))| {
        let b = if self.pixel_boxes {
          pixel.as_array()
        } else {
          [d.bbox.cx, d.bbox.cy, d.bbox.w, d.bbox.h]
        };
        let areas = result
          .masks
          .get(i)
          .map(|set| {
            set
              .masks
              .iter()
              .map(|m| m.area().to_string())
              .collect::<Vec<_>>()
              .join(" ")
          })
          .unwrap_or_default();
        format!(
          "{}, {:.4}, {:.4}, {:.4}, {:.4}, {:.4}, {}",
          d.phrase, d.score, b[0], b[1], b[2], b[3], areas
        )
      })
      .collect()
  }

  pub fn record(
    &self,
    frame: &RgbFrame,
    result: &GroundedResult,
    path: &Path,
  ) -> Result<(), std::io::Error> {
    std::fs::write(path.with_extension("txt"), self.lines(frame, result).join("\n"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    boxes::CxCyWh,
    model::{Detection, MaskSet},
  };
  use ndarray::Array2;

  fn square_mask(h: usize, w: usize) -> Mask {
    let mut data = Array2::from_elem((h, w), false);
    for y in 1..3 {
      for x in 1..3 {
        data[[y, x]] = true;
      }
    }
    Mask::from(data)
  }

  #[test]
  fn empty_mask_leaves_base_unchanged() {
    let base = RgbImage::from_fn(6, 4, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 7]));
    let composed = show_mask(&Mask::empty(4, 6), &base, FIXED_MASK_COLOR);
    for (x, y, p) in composed.enumerate_pixels() {
      let b = base.get_pixel(x, y);
      assert_eq!([p[0], p[1], p[2]], [b[0], b[1], b[2]]);
      assert_eq!(p[3], 255);
    }
  }

  #[test]
  fn mask_pixels_are_tinted() {
    let base = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
    let composed = show_mask(&square_mask(4, 4), &base, FIXED_MASK_COLOR);
    let inside = composed.get_pixel(1, 1);
    let outside = composed.get_pixel(0, 0);
    assert!(inside[2] > 100);
    assert!(inside[0] < inside[1] && inside[1] < inside[2]);
    assert_eq!(*outside, Rgba([0, 0, 0, 255]));
  }

  #[test]
  fn mask_layer_uses_scaled_color() {
    let layer = mask_layer(&square_mask(4, 4), FIXED_MASK_COLOR);
    assert_eq!(*layer.get_pixel(2, 2), Rgba([30, 144, 255, 153]));
    assert_eq!(*layer.get_pixel(3, 3), Rgba([0, 0, 0, 0]));
  }

  #[test]
  fn color_components_are_truncated() {
    let layer = mask_layer(&square_mask(4, 4), [0.999, 0.5, 0.0039, 0.8]);
    assert_eq!(*layer.get_pixel(2, 2), Rgba([254, 127, 0, 204]));
  }

  #[test]
  fn seeded_random_colors_repeat() {
    let a = ColorPicker::new(MaskColor::Random, Some(7));
    let b = ColorPicker::new(MaskColor::Random, Some(7));
    let (ca, cb) = (a.next_color(), b.next_color());
    assert_eq!(ca, cb);
    assert_eq!(ca[3], RANDOM_MASK_ALPHA);
    assert!(ca[..3].iter().all(|c| (0.0..1.0).contains(c)));
    assert_eq!(ColorPicker::new(MaskColor::Fixed, None).next_color(), FIXED_MASK_COLOR);
  }

  #[test]
  fn parse_mask_color() {
    assert_eq!("Fixed".parse(), Ok(MaskColor::Fixed));
    assert_eq!("random".parse(), Ok(MaskColor::Random));
    assert!("blue".parse::<MaskColor>().is_err());
  }

  fn sample_result() -> GroundedResult {
    GroundedResult {
      detections: DetectResult::from(vec![
        Detection {
          bbox: CxCyWh::new(0.5, 0.5, 0.5, 0.5),
          score: 0.42,
          phrase: "curb".into(),
        },
        Detection {
          bbox: CxCyWh::new(0.25, 0.25, 0.5, 0.5),
          score: 0.31,
          phrase: "curb".into(),
        },
      ]),
      masks: vec![
        MaskSet {
          masks: vec![square_mask(4, 8), Mask::empty(4, 8), square_mask(4, 8)],
          scores: vec![0.9, 0.8, 0.7],
        },
        MaskSet {
          masks: vec![Mask::empty(4, 8)],
          scores: vec![0.5],
        },
      ],
    }
  }

  #[test]
  fn one_overlay_per_candidate() {
    let frame = RgbFrame::from(RgbImage::new(8, 4));
    let result = sample_result();
    let draw = Draw::new(MaskColor::Fixed, None, Some(Path::new("/no/such/font.ttf")));
    let annotated = draw.annotate(&frame, &result.detections);
    let overlays = draw.overlays(&annotated, &result);

    let pairs: Vec<_> = overlays.iter().map(|o| (o.detection, o.candidate)).collect();
    assert_eq!(pairs, vec![(0, 0), (0, 1), (0, 2), (1, 0)]);
    assert_eq!(overlays[3].suffix(), "_1_0");
    assert!(overlays.iter().all(|o| o.image.dimensions() == (8, 4)));
  }

  #[test]
  fn annotate_draws_box_outline() {
    let frame = RgbFrame::from(RgbImage::new(64, 48));
    let detections = DetectResult::from(vec![Detection {
      bbox: CxCyWh::new(0.5, 0.5, 0.5, 0.5),
      score: 0.9,
      phrase: "curb".into(),
    }]);
    let draw = Draw::new(MaskColor::Fixed, None, Some(Path::new("/no/such/font.ttf")));
    let image = draw.annotate(&frame, &detections);
    // 框为 (16, 12) - (48, 36)
    assert_eq!(*image.get_pixel(30, 36), Rgb(LABEL_COLOR));
    assert_eq!(*image.get_pixel(48, 30), Rgb(LABEL_COLOR));
    assert_eq!(*image.get_pixel(32, 24), Rgb([0, 0, 0]));
  }

  #[test]
  fn missing_font_falls_back_to_embedded() {
    let font = load_font(Some(Path::new("/no/such/font.ttf")));
    let (w, h) = text_size(PxScale::from(LABEL_FONT_SIZE), &font, "curb 0.46");
    assert!(w > 0 && h > 0);
  }

  #[test]
  fn label_text_is_rendered() {
    let frame = RgbFrame::from(RgbImage::new(200, 200));
    let detections = DetectResult::from(vec![Detection {
      bbox: CxCyWh::new(0.5, 0.625, 0.5, 0.25),
      score: 0.46,
      phrase: "curb".into(),
    }]);
    let image = Draw::new(MaskColor::Fixed, None, None).annotate(&frame, &detections);
    // 标签底色区域为 (50, 76) - (150, 100)，其中应有文字像素
    let text_pixels = (52..100)
      .flat_map(|x| (78..98).map(move |y| (x, y)))
      .filter(|&(x, y)| *image.get_pixel(x, y) != Rgb(LABEL_COLOR))
      .count();
    assert!(text_pixels > 0);
  }

  #[test]
  fn record_lines() {
    let frame = RgbFrame::from(RgbImage::new(8, 4));
    let result = sample_result();
    let lines = Record { pixel_boxes: true }.lines(&frame, &result);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "curb, 0.4200, 2.0000, 1.0000, 6.0000, 3.0000, 4 0 4");
    let lines = Record { pixel_boxes: false }.lines(&frame, &result);
    assert_eq!(lines[1], "curb, 0.3100, 0.2500, 0.2500, 0.5000, 0.5000, 0");
  }
}
