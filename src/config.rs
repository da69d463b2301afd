// 该文件是 Grounded-SAM 项目的一部分。
// src/config.rs - 流水线配置
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

use std::path::PathBuf;

use crate::{
  device::Device,
  model::{
    DEFAULT_DETECTOR_CONFIG, DEFAULT_DETECTOR_REPO, DEFAULT_DETECTOR_TOKENIZER,
    DEFAULT_DETECTOR_WEIGHTS, Thresholds, session::LoadPolicy,
  },
  output::draw::MaskColor,
};

pub const DEFAULT_PROMPT: &str = "curb";
pub const DEFAULT_SAM_CHECKPOINT: &str = "sam_vit_h_4b8939.encoder.onnx";
pub const DEFAULT_OUTPUT: &str = "grounded_sam.png";

/// 一次运行所需的全部配置
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
  /// 输入图像，`image://` URL 或裸路径
  pub input: String,
  pub prompt: String,
  pub thresholds: Thresholds,

  /// 仓库 id，或 `hf://` / `file://` URL
  pub detector_repo: String,
  pub detector_revision: Option<String>,
  pub detector_weights: String,
  pub detector_config: String,
  pub detector_tokenizer: String,
  pub detector_policy: LoadPolicy,

  /// SAM 编码器，`sam://` URL 或裸路径
  pub sam_checkpoint: String,
  pub sam_policy: LoadPolicy,
  pub multimask: bool,

  pub device: Device,
  pub num_threads: usize,
  /// 模型仓库缓存目录，缺省使用 hf-hub 的默认位置
  pub cache_dir: Option<PathBuf>,

  pub mask_color: MaskColor,
  pub seed: Option<u64>,
  /// 标签字体文件
  pub font: Option<PathBuf>,
  pub output: String,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      input: String::new(),
      prompt: DEFAULT_PROMPT.to_string(),
      thresholds: Thresholds::default(),
      detector_repo: DEFAULT_DETECTOR_REPO.to_string(),
      detector_revision: None,
      detector_weights: DEFAULT_DETECTOR_WEIGHTS.to_string(),
      detector_config: DEFAULT_DETECTOR_CONFIG.to_string(),
      detector_tokenizer: DEFAULT_DETECTOR_TOKENIZER.to_string(),
      detector_policy: LoadPolicy::Tolerant,
      sam_checkpoint: DEFAULT_SAM_CHECKPOINT.to_string(),
      sam_policy: LoadPolicy::Strict,
      multimask: true,
      device: Device::Auto,
      num_threads: 4,
      cache_dir: None,
      mask_color: MaskColor::Random,
      seed: None,
      font: None,
      output: DEFAULT_OUTPUT.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::utils::{parse_url_or_path, url_file_path};

  #[test]
  fn documented_defaults() {
    let config = PipelineConfig::default();
    assert_eq!(config.prompt, "curb");
    assert_eq!(config.thresholds.box_threshold, 0.3);
    assert_eq!(config.thresholds.text_threshold, 0.25);
    assert_eq!(config.detector_repo, "onnx-community/grounding-dino-tiny-ONNX");
    assert_eq!(config.detector_policy, LoadPolicy::Tolerant);
    assert_eq!(config.sam_policy, LoadPolicy::Strict);
    assert_eq!(config.device, Device::Auto);
    assert_eq!(config.mask_color, MaskColor::Random);
    assert!(config.multimask);
  }

  #[test]
  fn default_paths_resolve_under_working_directory() {
    let cwd = std::env::current_dir().unwrap();
    let config = PipelineConfig::default();

    let sam = parse_url_or_path(&config.sam_checkpoint, "sam").unwrap();
    assert_eq!(sam.scheme(), "sam");
    assert_eq!(url_file_path(&sam), cwd.join("sam_vit_h_4b8939.encoder.onnx"));

    let output = parse_url_or_path(&config.output, "image").unwrap();
    assert_eq!(output.scheme(), "image");
    assert_eq!(url_file_path(&output), cwd.join("grounded_sam.png"));
  }
}
