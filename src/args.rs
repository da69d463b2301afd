// 该文件是 Grounded-SAM 项目的一部分。
// src/args.rs - 项目参数配置
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

use clap::Parser;

use grounded_sam::{
  config::{DEFAULT_OUTPUT, DEFAULT_PROMPT, DEFAULT_SAM_CHECKPOINT, PipelineConfig},
  device::Device,
  model::{
    DEFAULT_DETECTOR_CONFIG, DEFAULT_DETECTOR_REPO, DEFAULT_DETECTOR_TOKENIZER,
    DEFAULT_DETECTOR_WEIGHTS, Thresholds, session::LoadPolicy,
  },
  output::draw::MaskColor,
};

/// Grounded-SAM 参数配置，每个参数也可以通过 `GSAM_*` 环境变量给出
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图像（image:// URL 或文件路径）
  #[arg(long, env = "GSAM_INPUT", value_name = "SOURCE")]
  pub input: String,

  /// 检测提示词
  #[arg(long, env = "GSAM_PROMPT", default_value = DEFAULT_PROMPT)]
  pub prompt: String,

  /// 检测框阈值 (0.0 - 1.0)
  #[arg(long, env = "GSAM_BOX_THRESHOLD", default_value_t = 0.3, value_name = "THRESHOLD")]
  pub box_threshold: f32,

  /// 文本阈值 (0.0 - 1.0)
  #[arg(long, env = "GSAM_TEXT_THRESHOLD", default_value_t = 0.25, value_name = "THRESHOLD")]
  pub text_threshold: f32,

  /// 检测器模型仓库 id，或 hf://<仓库>?weights=.. / file:///<目录> URL（URL 中的文件名优先）
  #[arg(long, env = "GSAM_DETECTOR_REPO", default_value = DEFAULT_DETECTOR_REPO)]
  pub detector_repo: String,

  /// 检测器模型仓库版本
  #[arg(long, env = "GSAM_DETECTOR_REVISION")]
  pub detector_revision: Option<String>,

  /// 检测器权重文件（仓库内路径）
  #[arg(long, env = "GSAM_DETECTOR_WEIGHTS", default_value = DEFAULT_DETECTOR_WEIGHTS)]
  pub detector_weights: String,

  /// 检测器配置文件（仓库内路径）
  #[arg(long, env = "GSAM_DETECTOR_CONFIG", default_value = DEFAULT_DETECTOR_CONFIG)]
  pub detector_config: String,

  /// 检测器分词器文件（仓库内路径）
  #[arg(long, env = "GSAM_DETECTOR_TOKENIZER", default_value = DEFAULT_DETECTOR_TOKENIZER)]
  pub detector_tokenizer: String,

  /// 检测器结构校验策略: strict / tolerant
  #[arg(long, env = "GSAM_DETECTOR_POLICY", default_value = "tolerant")]
  pub detector_policy: LoadPolicy,

  /// SAM 编码器（sam:// URL 或文件路径，解码器可用 ?decoder= 指定）
  #[arg(long, env = "GSAM_SAM_CHECKPOINT", default_value = DEFAULT_SAM_CHECKPOINT)]
  pub sam_checkpoint: String,

  /// SAM 结构校验策略: strict / tolerant
  #[arg(long, env = "GSAM_SAM_POLICY", default_value = "strict")]
  pub sam_policy: LoadPolicy,

  /// 每个框只输出一个掩码
  #[arg(long, env = "GSAM_SINGLE_MASK")]
  pub single_mask: bool,

  /// 推理设备: auto / cpu / cuda / cuda:N
  #[arg(long, env = "GSAM_DEVICE", default_value = "auto")]
  pub device: Device,

  /// 推理线程数
  #[arg(long, env = "GSAM_NUM_THREADS", default_value_t = 4)]
  pub num_threads: usize,

  /// 模型仓库缓存目录
  #[arg(long, env = "GSAM_CACHE_DIR", value_name = "DIR")]
  pub cache_dir: Option<PathBuf>,

  /// 掩码颜色: random / fixed
  #[arg(long, env = "GSAM_MASK_COLOR", default_value = "random")]
  pub mask_color: MaskColor,

  /// 随机颜色种子
  #[arg(long, env = "GSAM_SEED")]
  pub seed: Option<u64>,

  /// 标签字体文件
  #[arg(long, env = "GSAM_FONT", value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 输出（image:// 文件或 folder:// 目录）
  #[arg(long, env = "GSAM_OUTPUT", default_value = DEFAULT_OUTPUT)]
  pub output: String,
}

impl From<Args> for PipelineConfig {
  fn from(args: Args) -> Self {
    PipelineConfig {
      input: args.input,
      prompt: args.prompt,
      thresholds: Thresholds {
        box_threshold: args.box_threshold,
        text_threshold: args.text_threshold,
      },
      detector_repo: args.detector_repo,
      detector_revision: args.detector_revision,
      detector_weights: args.detector_weights,
      detector_config: args.detector_config,
      detector_tokenizer: args.detector_tokenizer,
      detector_policy: args.detector_policy,
      sam_checkpoint: args.sam_checkpoint,
      sam_policy: args.sam_policy,
      multimask: !args.single_mask,
      device: args.device,
      num_threads: args.num_threads,
      cache_dir: args.cache_dir,
      mask_color: args.mask_color,
      seed: args.seed,
      font: args.font,
      output: args.output,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_match_pipeline_config() {
    let args = Args::try_parse_from(["grounded-sam", "--input", "demo.jpg"]).unwrap();
    let config = PipelineConfig::from(args);
    assert_eq!(
      config,
      PipelineConfig {
        input: "demo.jpg".to_string(),
        ..PipelineConfig::default()
      }
    );
  }

  #[test]
  fn options_are_mapped() {
    let args = Args::try_parse_from([
      "grounded-sam",
      "--input",
      "image:///data/road.png",
      "--prompt",
      "dog . cat",
      "--box-threshold",
      "0.4",
      "--device",
      "cuda:1",
      "--sam-policy",
      "tolerant",
      "--single-mask",
      "--mask-color",
      "fixed",
      "--seed",
      "42",
    ])
    .unwrap();
    let config = PipelineConfig::from(args);
    assert_eq!(config.prompt, "dog . cat");
    assert_eq!(config.thresholds.box_threshold, 0.4);
    assert_eq!(config.thresholds.text_threshold, 0.25);
    assert_eq!(config.device, Device::Cuda(1));
    assert_eq!(config.sam_policy, LoadPolicy::Tolerant);
    assert!(!config.multimask);
    assert_eq!(config.mask_color, MaskColor::Fixed);
    assert_eq!(config.seed, Some(42));
  }

  #[test]
  fn invalid_device_is_rejected() {
    assert!(Args::try_parse_from(["grounded-sam", "--input", "a.jpg", "--device", "tpu"]).is_err());
  }
}
