// 该文件是 Grounded-SAM 项目的一部分。
// src/model/session.rs - ONNX Runtime 会话构建与结构校验
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
  fmt,
  path::{Path, PathBuf},
  str::FromStr,
};

use ort::{
  ep::{CPU as CPUExecutionProvider, CUDA as CUDAExecutionProvider, ExecutionProviderDispatch},
  session::{Session, builder::GraphOptimizationLevel},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::Device;

/// 加载权重时对模型结构不匹配的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
  /// 任何缺失或多余的输入输出都视为错误
  Strict,
  /// 记录警告后继续，错误延迟到推理时暴露
  Tolerant,
}

impl FromStr for LoadPolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "strict" => Ok(LoadPolicy::Strict),
      "tolerant" => Ok(LoadPolicy::Tolerant),
      other => Err(format!("未知加载策略: {}，可选值为 strict 或 tolerant", other)),
    }
  }
}

impl fmt::Display for LoadPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LoadPolicy::Strict => write!(f, "strict"),
      LoadPolicy::Tolerant => write!(f, "tolerant"),
    }
  }
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("ONNX Runtime 错误: {0}")]
  Ort(String),
  #[error("CUDA 设备 {0} 不可用: {1}")]
  DeviceUnavailable(i32, String),
  #[error("模型 {model} 结构不匹配: 缺少 {missing:?}, 多余 {unexpected:?}")]
  Incompatible {
    model: String,
    missing: Vec<String>,
    unexpected: Vec<String>,
  },
  #[error("模型输出缺失: {0}")]
  MissingOutput(String),
}

impl SessionError {
  pub fn ort(e: impl fmt::Display) -> Self {
    SessionError::Ort(e.to_string())
  }
}

/// 期望的模型输入输出名称
#[derive(Debug, Clone, Copy)]
pub struct IoSignature {
  pub inputs: &'static [&'static str],
  pub outputs: &'static [&'static str],
}

/// 结构比较结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoReport {
  pub missing: Vec<String>,
  pub unexpected: Vec<String>,
}

impl IoReport {
  pub fn compare(actual: &[String], expected: &[&str]) -> Self {
    let missing = expected
      .iter()
      .filter(|e| !actual.iter().any(|a| a == *e))
      .map(|e| e.to_string())
      .collect();
    let unexpected = actual
      .iter()
      .filter(|a| !expected.contains(&a.as_str()))
      .cloned()
      .collect();
    Self {
      missing,
      unexpected,
    }
  }

  pub fn merge(mut self, other: IoReport) -> Self {
    self.missing.extend(other.missing);
    self.unexpected.extend(other.unexpected);
    self
  }

  pub fn is_clean(&self) -> bool {
    self.missing.is_empty() && self.unexpected.is_empty()
  }

  /// 按策略处理比较结果
  pub fn enforce(self, model: &str, policy: LoadPolicy) -> Result<Self, SessionError> {
    if self.is_clean() {
      return Ok(self);
    }
    match policy {
      LoadPolicy::Strict => Err(SessionError::Incompatible {
        model: model.to_string(),
        missing: self.missing,
        unexpected: self.unexpected,
      }),
      LoadPolicy::Tolerant => {
        warn!(
          "模型 {} 结构不完全匹配（宽松模式，继续加载）: 缺少 {:?}, 多余 {:?}",
          model, self.missing, self.unexpected
        );
        Ok(self)
      }
    }
  }
}

pub fn input_names(session: &Session) -> Vec<String> {
  session.inputs().iter().map(|i| i.name().to_string()).collect()
}

pub fn output_names(session: &Session) -> Vec<String> {
  session.outputs().iter().map(|o| o.name().to_string()).collect()
}

/// 按签名检查会话结构
pub fn check_signature(
  session: &Session,
  model: &str,
  signature: &IoSignature,
  policy: LoadPolicy,
) -> Result<IoReport, SessionError> {
  let inputs = input_names(session);
  let outputs = output_names(session);
  debug!("模型 {} 输入: {:?}", model, inputs);
  debug!("模型 {} 输出: {:?}", model, outputs);

  IoReport::compare(&inputs, signature.inputs)
    .merge(IoReport::compare(&outputs, signature.outputs))
    .enforce(model, policy)
}

/// ONNX 会话构建器
pub struct SessionBuilder {
  model_path: PathBuf,
  device: Device,
  num_threads: usize,
}

impl SessionBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      device: Device::default(),
      num_threads: 4,
    }
  }

  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn num_threads(mut self, num_threads: usize) -> Self {
    self.num_threads = num_threads;
    self
  }

  pub fn build(self) -> Result<Session, SessionError> {
    if !self.model_path.exists() {
      return Err(SessionError::NotFound(self.model_path));
    }

    let size = std::fs::metadata(&self.model_path)
      .map(|m| m.len())
      .unwrap_or_default();
    info!(
      "加载模型文件: {} ({:.2} MB)",
      self.model_path.display(),
      size as f64 / (1024.0 * 1024.0)
    );

    match self.device {
      Device::Cpu => self.commit(CPUExecutionProvider::default().build()),
      Device::Cuda(id) => self
        .commit(cuda_provider(id))
        .map_err(|e| match e {
          SessionError::Ort(msg) => SessionError::DeviceUnavailable(id, msg),
          other => other,
        }),
      Device::Auto => match self.commit(cuda_provider(0)) {
        Ok(session) => {
          info!("使用 CUDA:0 执行推理");
          Ok(session)
        }
        Err(e) => {
          warn!("CUDA 不可用 ({})，回退到 CPU", e);
          self.commit(CPUExecutionProvider::default().build())
        }
      },
    }
  }

  fn commit(&self, provider: ExecutionProviderDispatch) -> Result<Session, SessionError> {
    Session::builder()
      .map_err(SessionError::ort)?
      .with_execution_providers([provider])
      .map_err(SessionError::ort)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(SessionError::ort)?
      .with_intra_threads(self.num_threads)
      .map_err(SessionError::ort)?
      .commit_from_file(&self.model_path)
      .map_err(SessionError::ort)
  }
}

fn cuda_provider(id: i32) -> ExecutionProviderDispatch {
  CUDAExecutionProvider::default()
    .with_device_id(id)
    .build()
    .error_on_failure()
}
