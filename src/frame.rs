// 该文件是 Grounded-SAM 项目的一部分。
// src/frame.rs - RGB 帧定义
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

use image::{RgbImage, imageops::FilterType};
use ndarray::Array4;

const RGB_CHANNELS: usize = 3;

/// 像素归一化参数：`(pixel * rescale - mean) / std`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalize {
  pub rescale: f32,
  pub mean: [f32; 3],
  pub std: [f32; 3],
}

/// 从磁盘读入后不再修改的 RGB 帧（HWC 排列）
#[derive(Debug, Clone)]
pub struct RgbFrame {
  image: RgbImage,
}

impl From<RgbImage> for RgbFrame {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl AsRef<RgbImage> for RgbFrame {
  fn as_ref(&self) -> &RgbImage {
    &self.image
  }
}

impl RgbFrame {
  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  /// 缩放到 `resize = (宽, 高)`，归一化后放入 `canvas = (宽, 高)` 的左上角，
  /// 其余位置补零，输出 `[1, 3, 高, 宽]` 的 NCHW 张量
  pub fn to_nchw_tensor(
    &self,
    resize: (u32, u32),
    canvas: (u32, u32),
    normalize: &Normalize,
  ) -> Array4<f32> {
    let (rw, rh) = resize;
    let (cw, ch) = canvas;
    debug_assert!(rw <= cw && rh <= ch);

    let resized = if (rw, rh) == self.image.dimensions() {
      self.image.clone()
    } else {
      image::imageops::resize(&self.image, rw, rh, FilterType::Triangle)
    };

    let mut tensor = Array4::<f32>::zeros((1, RGB_CHANNELS, ch as usize, cw as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
      for c in 0..RGB_CHANNELS {
        let value = pixel[c] as f32 * normalize.rescale;
        tensor[[0, c, y as usize, x as usize]] = (value - normalize.mean[c]) / normalize.std[c];
      }
    }
    tensor
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use image::Rgb;

  #[test]
  fn nchw_tensor_is_normalized_and_padded() {
    let image = RgbImage::from_pixel(4, 2, Rgb([255, 0, 51]));
    let frame = RgbFrame::from(image);
    let norm = Normalize {
      rescale: 1.0 / 255.0,
      mean: [0.5, 0.0, 0.0],
      std: [0.5, 1.0, 0.1],
    };
    let t = frame.to_nchw_tensor((4, 2), (5, 3), &norm);
    assert_eq!(t.shape(), &[1, 3, 3, 5]);
    assert_abs_diff_eq!(t[[0, 0, 1, 3]], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(t[[0, 1, 0, 0]], 0.0, epsilon = 1e-6);
    assert_abs_diff_eq!(t[[0, 2, 0, 0]], 2.0, epsilon = 1e-5);
    // 补零区域
    assert_eq!(t[[0, 0, 2, 4]], 0.0);
    assert_eq!(t[[0, 2, 0, 4]], 0.0);
  }

  #[test]
  fn frame_dimensions() {
    let frame = RgbFrame::from(RgbImage::new(640, 480));
    assert_eq!(frame.width(), 640);
    assert_eq!(frame.height(), 480);
    assert_eq!(frame.channels(), 3);
  }
}
