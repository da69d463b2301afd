// 该文件是 Grounded-SAM 项目的一部分。
// src/device.rs - 计算设备选择
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

use std::{fmt, str::FromStr};

use thiserror::Error;

/// 推理设备，作为显式配置传入每个模型构建器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
  /// 优先使用 CUDA:0，不可用时回退到 CPU（回退会记录警告日志）
  #[default]
  Auto,
  Cpu,
  /// 指定 CUDA 设备，不可用时直接报错
  Cuda(i32),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DeviceParseError {
  #[error("未知设备: {0}，可选值为 auto、cpu、cuda 或 cuda:N")]
  Unknown(String),
  #[error("无效的 CUDA 设备编号: {0}")]
  InvalidIndex(String),
}

impl FromStr for Device {
  type Err = DeviceParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let lower = s.trim().to_lowercase();
    match lower.as_str() {
      "auto" => Ok(Device::Auto),
      "cpu" => Ok(Device::Cpu),
      "cuda" | "gpu" => Ok(Device::Cuda(0)),
      other => {
        let index = other
          .strip_prefix("cuda:")
          .ok_or_else(|| DeviceParseError::Unknown(s.to_string()))?;
        index
          .parse::<i32>()
          .ok()
          .filter(|i| *i >= 0)
          .map(Device::Cuda)
          .ok_or_else(|| DeviceParseError::InvalidIndex(index.to_string()))
      }
    }
  }
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Auto => write!(f, "auto"),
      Device::Cpu => write!(f, "cpu"),
      Device::Cuda(i) => write!(f, "cuda:{}", i),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_devices() {
    assert_eq!("auto".parse(), Ok(Device::Auto));
    assert_eq!("CPU".parse(), Ok(Device::Cpu));
    assert_eq!("cuda".parse(), Ok(Device::Cuda(0)));
    assert_eq!("cuda:1".parse(), Ok(Device::Cuda(1)));
    assert_eq!(
      "cuda:x".parse::<Device>(),
      Err(DeviceParseError::InvalidIndex("x".to_string()))
    );
    assert!(matches!(
      "tpu".parse::<Device>(),
      Err(DeviceParseError::Unknown(_))
    ));
  }

  #[test]
  fn display_round_trip() {
    for d in [Device::Auto, Device::Cpu, Device::Cuda(3)] {
      assert_eq!(d.to_string().parse(), Ok(d));
    }
  }
}
