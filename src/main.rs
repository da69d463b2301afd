// 该文件是 Grounded-SAM 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use grounded_sam::{
  FromUrl,
  config::PipelineConfig,
  input::InputWrapper,
  model::GroundedSam,
  output::{OutputWrapper, draw::Draw},
  task::{OneShotTask, Task},
  utils::parse_url_or_path,
};

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let config = PipelineConfig::from(args::Args::parse());

  info!("输入来源: {}", config.input);
  info!("提示词: {}", config.prompt);
  info!(
    "阈值: box {} / text {}",
    config.thresholds.box_threshold, config.thresholds.text_threshold
  );
  info!("检测器: {}/{}", config.detector_repo, config.detector_weights);
  info!("SAM: {}", config.sam_checkpoint);
  info!("推理设备: {}", config.device);
  info!("输出路径: {}", config.output);

  let input = InputWrapper::from_url(&parse_url_or_path(&config.input, "image")?)?;
  let output = OutputWrapper::from_url(&parse_url_or_path(&config.output, "image")?)?.with_draw(
    Draw::new(config.mask_color, config.seed, config.font.as_deref()),
  );

  info!("正在加载模型...");
  let now = std::time::Instant::now();
  let mut model = GroundedSam::from_config(&config)?;
  info!("模型加载完成，耗时: {:.2?}", now.elapsed());

  OneShotTask.run_task(input, &mut model, &output)?;

  Ok(())
}
