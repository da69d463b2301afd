// 该文件是 Grounded-SAM 项目的一部分。
// src/boxes.rs - 边界框表示与坐标变换
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

//! 边界框的两种表示以及检测器到分割模型之间的坐标变换。
//!
//! 所有变换都是纯函数，不做任何裁剪：越界的框原样传递给分割模型。

/// 中心点形式的边界框 `(cx, cy, w, h)`，检测器输出为归一化坐标
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CxCyWh {
  pub cx: f32,
  pub cy: f32,
  pub w: f32,
  pub h: f32,
}

/// 角点形式的边界框 `(x1, y1, x2, y2)`，可以是归一化坐标或像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct XyXy {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
}

impl CxCyWh {
  pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
    Self { cx, cy, w, h }
  }

  pub fn to_xyxy(&self) -> XyXy {
    cxcywh_to_xyxy(*self)
  }
}

impl From<[f32; 4]> for CxCyWh {
  fn from(v: [f32; 4]) -> Self {
    Self::new(v[0], v[1], v[2], v[3])
  }
}

impl XyXy {
  pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
    Self { x1, y1, x2, y2 }
  }

  pub fn to_cxcywh(&self) -> CxCyWh {
    xyxy_to_cxcywh(*self)
  }

  /// 按 `(sx, sy, sx, sy)` 缩放四个坐标
  pub fn scale(&self, sx: f32, sy: f32) -> XyXy {
    XyXy {
      x1: self.x1 * sx,
      y1: self.y1 * sy,
      x2: self.x2 * sx,
      y2: self.y2 * sy,
    }
  }

  pub fn as_array(&self) -> [f32; 4] {
    [self.x1, self.y1, self.x2, self.y2]
  }
}

pub fn cxcywh_to_xyxy(b: CxCyWh) -> XyXy {
  XyXy {
    x1: b.cx - 0.5 * b.w,
    y1: b.cy - 0.5 * b.h,
    x2: b.cx + 0.5 * b.w,
    y2: b.cy + 0.5 * b.h,
  }
}

pub fn xyxy_to_cxcywh(b: XyXy) -> CxCyWh {
  CxCyWh {
    cx: (b.x1 + b.x2) / 2.0,
    cy: (b.y1 + b.y2) / 2.0,
    w: b.x2 - b.x1,
    h: b.y2 - b.y1,
  }
}

/// 归一化中心点框 -> 像素角点框（宽 `width`，高 `height` 的图像）
pub fn to_pixel_xyxy(b: CxCyWh, width: u32, height: u32) -> XyXy {
  cxcywh_to_xyxy(b).scale(width as f32, height as f32)
}

/// SAM 的最长边缩放：将图像最长边缩放到 `target_length`，并同步变换坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeLongestSide {
  pub target_length: u32,
}

impl Default for ResizeLongestSide {
  fn default() -> Self {
    Self {
      target_length: 1024,
    }
  }
}

impl ResizeLongestSide {
  pub fn new(target_length: u32) -> Self {
    Self { target_length }
  }

  /// 计算缩放后的 `(高, 宽)`，取整规则为 `int(x * scale + 0.5)`
  pub fn preprocess_shape(&self, height: u32, width: u32) -> (u32, u32) {
    let scale = self.target_length as f64 / height.max(width) as f64;
    let new_h = (height as f64 * scale + 0.5) as u32;
    let new_w = (width as f64 * scale + 0.5) as u32;
    (new_h, new_w)
  }

  /// 将原图 `(height, width)` 下的像素坐标点变换到模型输入坐标
  pub fn apply_coord(&self, x: f32, y: f32, height: u32, width: u32) -> (f32, f32) {
    let (new_h, new_w) = self.preprocess_shape(height, width);
    (
      x * (new_w as f32 / width as f32),
      y * (new_h as f32 / height as f32),
    )
  }

  pub fn apply_box(&self, b: XyXy, height: u32, width: u32) -> XyXy {
    let (x1, y1) = self.apply_coord(b.x1, b.y1, height, width);
    let (x2, y2) = self.apply_coord(b.x2, b.y2, height, width);
    XyXy { x1, y1, x2, y2 }
  }

  pub fn apply_boxes(&self, boxes: &[XyXy], height: u32, width: u32) -> Vec<XyXy> {
    boxes
      .iter()
      .map(|b| self.apply_box(*b, height, width))
      .collect()
  }
}
