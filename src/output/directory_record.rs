// 该文件是 Grounded-SAM 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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
  path::{Path, PathBuf},
  sync::atomic::{AtomicU16, Ordering},
};

use chrono::{Datelike, Utc};
use image::DynamicImage;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RgbFrame,
  model::GroundedResult,
  output::{
    Render,
    draw::{Draw, Record},
  },
  utils::{url_file_path, with_file_suffix},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 按日期分目录保存结果：`<dir>/YYYY/MM/DD/HH-MM-SS-XXXX.png`
///
/// `?record` 额外写出像素坐标的文本记录，`?record=normalized` 写归一化坐标；
/// 没有检测结果时默认不落盘，`?always` 则总是保存。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  draw: Draw,
  record: Option<Record>,
  frame_counter: AtomicU16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let record = uri
      .query_pairs()
      .find(|(k, _)| k == "record")
      .map(|(_, v)| Record {
        pixel_boxes: v != "normalized",
      });
    let always = uri.query_pairs().any(|(k, _)| k == "always");

    Ok(DirectoryRecordOutput {
      directory: url_file_path(uri),
      draw: Draw::default(),
      record,
      frame_counter: AtomicU16::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.png",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }

  fn save(
    &self,
    path: &Path,
    frame: &RgbFrame,
    result: &GroundedResult,
  ) -> Result<(), DirectoryRecordOutputError> {
    let annotated = self.draw.annotate(frame, &result.detections);
    annotated.save(path)?;

    for overlay in self.draw.overlays(&annotated, result) {
      let overlay_path = with_file_suffix(path, &overlay.suffix());
      DynamicImage::ImageRgba8(overlay.image)
        .to_rgb8()
        .save(&overlay_path)?;
      debug!("保存叠加图: {}", overlay_path.display());
    }

    if let Some(record) = &self.record {
      record.record(frame, result, path)?;
    }

    info!("结果已保存: {}", path.display());
    Ok(())
  }
}

impl Render<RgbFrame, GroundedResult> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RgbFrame, result: &GroundedResult) -> Result<(), Self::Error> {
    if !self.always && result.detections.is_empty() {
      debug!("没有检测结果，跳过保存");
      return Ok(());
    }
    let path = self.frame_path()?;
    self.save(&path, frame, result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    boxes::CxCyWh,
    model::{DetectResult, Detection, Mask, MaskSet},
  };
  use image::RgbImage;

  fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
      for entry in std::fs::read_dir(d).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
          stack.push(path);
        } else {
          files.push(path);
        }
      }
    }
    files.sort();
    files
  }

  #[test]
  fn parses_query_options() {
    let url = url::Url::parse("folder:///tmp/out?record=normalized&always").unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    assert_eq!(output.directory, PathBuf::from("/tmp/out"));
    assert!(output.always);
    assert!(matches!(output.record, Some(Record { pixel_boxes: false })));
  }

  #[test]
  fn skips_empty_results_unless_always() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("folder://{}", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    let frame = RgbFrame::from(RgbImage::new(8, 4));
    output
      .render_result(&frame, &GroundedResult::default())
      .unwrap();
    assert!(files_under(dir.path()).is_empty());
  }

  #[test]
  fn writes_frame_overlays_and_record() {
    let dir = tempfile::tempdir().unwrap();
    let url = url::Url::parse(&format!("folder://{}?record", dir.path().display())).unwrap();
    let output = DirectoryRecordOutput::from_url(&url).unwrap();
    let frame = RgbFrame::from(RgbImage::new(8, 4));
    let result = GroundedResult {
      detections: DetectResult::from(vec![Detection {
        bbox: CxCyWh::new(0.5, 0.5, 1.0, 1.0),
        score: 0.5,
        phrase: "curb".into(),
      }]),
      masks: vec![MaskSet {
        masks: vec![Mask::empty(4, 8), Mask::empty(4, 8)],
        scores: vec![0.9, 0.1],
      }],
    };
    output.render_result(&frame, &result).unwrap();

    let files = files_under(dir.path());
    let names: Vec<String> = files
      .iter()
      .map(|p| p.extension().unwrap().to_string_lossy().into_owned())
      .collect();
    assert_eq!(files.len(), 4);
    assert_eq!(names.iter().filter(|e| *e == "png").count(), 3);
    assert_eq!(names.iter().filter(|e| *e == "txt").count(), 1);
  }
}
