// 该文件是 Grounded-SAM 项目的一部分。
// src/model/grounding_dino.rs - GroundingDINO 开放词汇检测器
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

use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, ArrayView2, Ix3};
use ort::{
  session::Session,
  value::{DynValue, Tensor},
};
use serde::Deserialize;
use thiserror::Error;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl,
  boxes::CxCyWh,
  device::Device,
  frame::{Normalize, RgbFrame},
  model::{
    Detect, DetectResult, Detection, Thresholds,
    hub::{HubError, HubRepo},
    session::{IoSignature, LoadPolicy, SessionBuilder, SessionError, check_signature},
  },
  utils::url_file_path,
};

pub const DEFAULT_DETECTOR_REPO: &str = "onnx-community/grounding-dino-tiny-ONNX";
pub const DEFAULT_DETECTOR_WEIGHTS: &str = "onnx/model.onnx";
pub const DEFAULT_DETECTOR_CONFIG: &str = "config.json";
pub const DEFAULT_DETECTOR_TOKENIZER: &str = "tokenizer.json";

const HUB_SCHEME: &str = "hf";
const LOCAL_SCHEME: &str = "file";

const INPUT_PIXEL_VALUES: &str = "pixel_values";
const INPUT_IDS: &str = "input_ids";
const INPUT_TOKEN_TYPE_IDS: &str = "token_type_ids";
const INPUT_ATTENTION_MASK: &str = "attention_mask";
const INPUT_PIXEL_MASK: &str = "pixel_mask";
const OUTPUT_LOGITS: &str = "logits";
const OUTPUT_BOXES: &str = "pred_boxes";

const SIGNATURE: IoSignature = IoSignature {
  inputs: &[
    INPUT_PIXEL_VALUES,
    INPUT_IDS,
    INPUT_TOKEN_TYPE_IDS,
    INPUT_ATTENTION_MASK,
    INPUT_PIXEL_MASK,
  ],
  outputs: &[OUTPUT_LOGITS, OUTPUT_BOXES],
};

#[derive(Error, Debug)]
pub enum DetectorError {
  #[error("模型下载错误: {0}")]
  Hub(#[from] HubError),
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("无法读取模型配置 {0}: {1}")]
  ConfigIo(PathBuf, #[source] std::io::Error),
  #[error("模型配置解析失败 {0}: {1}")]
  Config(PathBuf, #[source] serde_json::Error),
  #[error("分词器错误: {0}")]
  Tokenizer(String),
  #[error("会话错误: {0}")]
  Session(#[from] SessionError),
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("模型输出形状错误: {0}")]
  OutputShape(String),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl DetectorError {
  fn inference(e: impl std::fmt::Display) -> Self {
    DetectorError::Inference(e.to_string())
  }
}

/// 由模型配置解析得到的检测器规格，缺省字段取 GroundingDINO 的默认值
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectorSpec {
  #[serde(default)]
  pub model_type: Option<String>,
  #[serde(default = "default_max_text_len")]
  pub max_text_len: usize,
  #[serde(default = "default_num_queries")]
  pub num_queries: usize,
  #[serde(default)]
  pub size: ResizeSpec,
  #[serde(default = "default_image_mean")]
  pub image_mean: [f32; 3],
  #[serde(default = "default_image_std")]
  pub image_std: [f32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ResizeSpec {
  #[serde(default = "default_shortest_edge")]
  pub shortest_edge: u32,
  #[serde(default = "default_longest_edge")]
  pub longest_edge: u32,
}

fn default_max_text_len() -> usize {
  256
}

fn default_num_queries() -> usize {
  900
}

fn default_shortest_edge() -> u32 {
  800
}

fn default_longest_edge() -> u32 {
  1333
}

fn default_image_mean() -> [f32; 3] {
  [0.485, 0.456, 0.406]
}

fn default_image_std() -> [f32; 3] {
  [0.229, 0.224, 0.225]
}

impl Default for ResizeSpec {
  fn default() -> Self {
    Self {
      shortest_edge: default_shortest_edge(),
      longest_edge: default_longest_edge(),
    }
  }
}

impl Default for DetectorSpec {
  fn default() -> Self {
    Self {
      model_type: None,
      max_text_len: default_max_text_len(),
      num_queries: default_num_queries(),
      size: ResizeSpec::default(),
      image_mean: default_image_mean(),
      image_std: default_image_std(),
    }
  }
}

impl DetectorSpec {
  pub fn from_file(path: &Path) -> Result<Self, DetectorError> {
    let text =
      std::fs::read_to_string(path).map_err(|e| DetectorError::ConfigIo(path.to_path_buf(), e))?;
    let spec: DetectorSpec =
      serde_json::from_str(&text).map_err(|e| DetectorError::Config(path.to_path_buf(), e))?;
    match spec.model_type.as_deref() {
      Some("grounding-dino") | None => {}
      Some(other) => warn!("模型类型为 {}，并非 grounding-dino", other),
    }
    Ok(spec)
  }

  fn normalize(&self) -> Normalize {
    Normalize {
      rescale: 1.0 / 255.0,
      mean: self.image_mean,
      std: self.image_std,
    }
  }
}

/// 检测器权重的来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorSource {
  Hub {
    repo: String,
    revision: Option<String>,
    cache_dir: Option<PathBuf>,
  },
  /// 已下载到本地目录的模型文件
  Local(PathBuf),
}

/// 解析出的本地文件
#[derive(Debug, Clone)]
struct DetectorArtifacts {
  weights: PathBuf,
  config: PathBuf,
  tokenizer: PathBuf,
}

pub struct GroundingDinoBuilder {
  source: DetectorSource,
  weights_file: String,
  config_file: String,
  tokenizer_file: String,
  device: Device,
  policy: LoadPolicy,
  num_threads: usize,
}

impl FromUrl for GroundingDinoBuilder {
  type Error = DetectorError;

  /// `hf://<owner>/<name>?weights=..&config=..&tokenizer=..&revision=..`
  /// 或 `file:///<dir>?weights=..`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let source = match url.scheme() {
      HUB_SCHEME => {
        let repo = format!(
          "{}{}",
          url.host_str().unwrap_or_default(),
          url.path().trim_end_matches('/')
        );
        let revision = url
          .query_pairs()
          .find(|(k, _)| k == "revision")
          .map(|(_, v)| v.into_owned());
        DetectorSource::Hub {
          repo,
          revision,
          cache_dir: None,
        }
      }
      LOCAL_SCHEME => DetectorSource::Local(url_file_path(url)),
      other => return Err(DetectorError::SchemeMismatch(other.to_string())),
    };

    let mut builder = GroundingDinoBuilder::new(source);
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "weights" => builder.weights_file = v.into_owned(),
        "config" => builder.config_file = v.into_owned(),
        "tokenizer" => builder.tokenizer_file = v.into_owned(),
        _ => {}
      }
    }
    Ok(builder)
  }
}

impl GroundingDinoBuilder {
  pub fn new(source: DetectorSource) -> Self {
    Self {
      source,
      weights_file: DEFAULT_DETECTOR_WEIGHTS.to_string(),
      config_file: DEFAULT_DETECTOR_CONFIG.to_string(),
      tokenizer_file: DEFAULT_DETECTOR_TOKENIZER.to_string(),
      device: Device::default(),
      policy: LoadPolicy::Tolerant,
      num_threads: 4,
    }
  }

  pub fn files(mut self, weights: &str, config: &str, tokenizer: &str) -> Self {
    self.weights_file = weights.to_string();
    self.config_file = config.to_string();
    self.tokenizer_file = tokenizer.to_string();
    self
  }

  /// 仅对仓库来源生效
  pub fn cache_dir(mut self, dir: Option<PathBuf>) -> Self {
    if let DetectorSource::Hub { cache_dir, .. } = &mut self.source {
      *cache_dir = dir;
    }
    self
  }

  pub fn device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  pub fn policy(mut self, policy: LoadPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn num_threads(mut self, num_threads: usize) -> Self {
    self.num_threads = num_threads;
    self
  }

  fn resolve(&self) -> Result<DetectorArtifacts, DetectorError> {
    match &self.source {
      DetectorSource::Hub {
        repo,
        revision,
        cache_dir,
      } => {
        let hub = HubRepo::open(repo, revision.as_deref(), cache_dir.clone())?;
        // 配置先于权重下载，仓库或文件名无效时尽早失败
        let config = hub.fetch(&self.config_file)?;
        let tokenizer = hub.fetch(&self.tokenizer_file)?;
        let weights = hub.fetch(&self.weights_file)?;
        Ok(DetectorArtifacts {
          weights,
          config,
          tokenizer,
        })
      }
      DetectorSource::Local(dir) => {
        let artifacts = DetectorArtifacts {
          weights: dir.join(&self.weights_file),
          config: dir.join(&self.config_file),
          tokenizer: dir.join(&self.tokenizer_file),
        };
        for path in [&artifacts.weights, &artifacts.config, &artifacts.tokenizer] {
          if !path.exists() {
            return Err(DetectorError::NotFound(path.clone()));
          }
        }
        Ok(artifacts)
      }
    }
  }

  pub fn build(self) -> Result<GroundingDino, DetectorError> {
    let artifacts = self.resolve()?;

    let spec = DetectorSpec::from_file(&artifacts.config)?;
    debug!("检测器规格: {:?}", spec);

    let tokenizer = Tokenizer::from_file(&artifacts.tokenizer)
      .map_err(|e| DetectorError::Tokenizer(e.to_string()))?;

    let session = SessionBuilder::new(&artifacts.weights)
      .device(self.device)
      .num_threads(self.num_threads)
      .build()?;
    check_signature(&session, "grounding-dino", &SIGNATURE, self.policy)?;

    let input_names = crate::model::session::input_names(&session);
    info!("检测器加载完成 ({} 策略)", self.policy);

    Ok(GroundingDino {
      session,
      tokenizer,
      spec,
      input_names,
    })
  }
}

pub struct GroundingDino {
  session: Session,
  tokenizer: Tokenizer,
  spec: DetectorSpec,
  input_names: Vec<String>,
}

impl GroundingDino {
  fn phrase(&self, ids: &[u32], positions: &[usize]) -> Result<String, DetectorError> {
    let token_ids: Vec<u32> = positions
      .iter()
      .filter_map(|p| ids.get(*p).copied())
      .collect();
    let text = self
      .tokenizer
      .decode(&token_ids, true)
      .map_err(|e| DetectorError::Tokenizer(e.to_string()))?;
    Ok(text.replace('.', "").trim().to_string())
  }
}

impl Detect for GroundingDino {
  type Error = DetectorError;

  fn detect(
    &mut self,
    frame: &RgbFrame,
    caption: &str,
    thresholds: &Thresholds,
  ) -> Result<DetectResult, Self::Error> {
    let caption = preprocess_caption(caption);
    debug!("检测提示词: {:?}", caption);

    let encoding = self
      .tokenizer
      .encode(caption.as_str(), true)
      .map_err(|e| DetectorError::Tokenizer(e.to_string()))?;
    let len = encoding.get_ids().len().min(self.spec.max_text_len);
    let ids: Vec<u32> = encoding.get_ids()[..len].to_vec();
    let to_i64 = |v: &[u32]| v[..len].iter().map(|x| *x as i64).collect::<Vec<_>>();

    let (rw, rh) = resize_shape(
      frame.width(),
      frame.height(),
      self.spec.size.shortest_edge,
      self.spec.size.longest_edge,
    );
    debug!("检测器输入尺寸: {}x{}", rw, rh);

    let mut pixel_values = Some(frame.to_nchw_tensor((rw, rh), (rw, rh), &self.spec.normalize()));
    let mut pixel_mask = Some(Array3::<i64>::ones((1, rh as usize, rw as usize)));
    let shape = (1, len);
    let mut input_ids = Some(
      Array2::from_shape_vec(shape, to_i64(encoding.get_ids())).map_err(DetectorError::inference)?,
    );
    let mut attention_mask = Some(
      Array2::from_shape_vec(shape, to_i64(encoding.get_attention_mask()))
        .map_err(DetectorError::inference)?,
    );
    let mut token_type_ids = Some(Array2::<i64>::zeros(shape));

    // 只喂给模型实际声明的输入
    let mut inputs: Vec<(String, DynValue)> = Vec::with_capacity(self.input_names.len());
    for name in &self.input_names {
      let value = match name.as_str() {
        INPUT_PIXEL_VALUES => pixel_values.take().map(|v| Tensor::from_array(v).map(|t| t.into_dyn())),
        INPUT_PIXEL_MASK => pixel_mask.take().map(|v| Tensor::from_array(v).map(|t| t.into_dyn())),
        INPUT_IDS => input_ids.take().map(|v| Tensor::from_array(v).map(|t| t.into_dyn())),
        INPUT_ATTENTION_MASK => attention_mask
          .take()
          .map(|v| Tensor::from_array(v).map(|t| t.into_dyn())),
        INPUT_TOKEN_TYPE_IDS => token_type_ids
          .take()
          .map(|v| Tensor::from_array(v).map(|t| t.into_dyn())),
        other => {
          warn!("检测器存在未知输入 {}，跳过", other);
          None
        }
      };
      if let Some(value) = value {
        inputs.push((name.clone(), value.map_err(DetectorError::inference)?));
      }
    }

    let now = std::time::Instant::now();
    let outputs = self.session.run(inputs).map_err(DetectorError::inference)?;
    debug!("检测器推理耗时: {:.2?}", now.elapsed());

    let logits = outputs
      .get(OUTPUT_LOGITS)
      .ok_or_else(|| SessionError::MissingOutput(OUTPUT_LOGITS.to_string()))?
      .try_extract_array::<f32>()
      .map_err(DetectorError::inference)?
      .into_dimensionality::<Ix3>()
      .map_err(|e| DetectorError::OutputShape(format!("{}: {}", OUTPUT_LOGITS, e)))?
      .to_owned();
    let boxes = outputs
      .get(OUTPUT_BOXES)
      .ok_or_else(|| SessionError::MissingOutput(OUTPUT_BOXES.to_string()))?
      .try_extract_array::<f32>()
      .map_err(DetectorError::inference)?
      .into_dimensionality::<Ix3>()
      .map_err(|e| DetectorError::OutputShape(format!("{}: {}", OUTPUT_BOXES, e)))?
      .to_owned();
    drop(outputs);

    if boxes.shape()[2] != 4 || logits.shape()[1] != boxes.shape()[1] {
      return Err(DetectorError::OutputShape(format!(
        "logits {:?}, pred_boxes {:?}",
        logits.shape(),
        boxes.shape()
      )));
    }
    debug!(
      "检测器输出: logits {:?}, pred_boxes {:?}",
      logits.shape(),
      boxes.shape()
    );

    let candidates = select_candidates(
      logits.index_axis(ndarray::Axis(0), 0),
      boxes.index_axis(ndarray::Axis(0), 0),
      ids.len(),
      thresholds,
    );

    let mut items = Vec::with_capacity(candidates.len());
    for c in candidates {
      let phrase = self.phrase(&ids, &c.tokens)?;
      items.push(Detection {
        bbox: c.bbox,
        score: c.score,
        phrase,
      });
    }

    info!("检测到 {} 个目标", items.len());
    Ok(DetectResult::from(items))
  }
}

/// 与 GroundingDINO 的提示词处理一致：小写、去空白、以句点结尾
pub fn preprocess_caption(caption: &str) -> String {
  let mut caption = caption.trim().to_lowercase();
  if !caption.ends_with('.') {
    caption.push('.');
  }
  caption
}

/// 短边缩放到 `shortest`，同时保证长边不超过 `longest`，返回 `(宽, 高)`
pub fn resize_shape(width: u32, height: u32, shortest: u32, longest: u32) -> (u32, u32) {
  let (w, h) = (width as f64, height as f64);
  let (min_side, max_side) = (w.min(h), w.max(h));
  let mut size = shortest as f64;
  if max_side / min_side * size > longest as f64 {
    size = (longest as f64 * min_side / max_side).round();
  }

  if (w <= h && w == size) || (h <= w && h == size) {
    return (width, height);
  }

  if w < h {
    (size as u32, (size * h / w) as u32)
  } else {
    ((size * w / h) as u32, size as u32)
  }
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
  bbox: CxCyWh,
  score: f32,
  /// 相似度超过文本阈值的词元位置
  tokens: Vec<usize>,
}

/// 按两个阈值筛选查询，保留模型原始顺序
///
/// `logits` 为 `(查询数, 最大文本长度)` 的原始输出，只有前 `num_tokens` 列有效。
fn select_candidates(
  logits: ArrayView2<f32>,
  boxes: ArrayView2<f32>,
  num_tokens: usize,
  thresholds: &Thresholds,
) -> Vec<Candidate> {
  let num_tokens = num_tokens.min(logits.ncols());
  let mut candidates = Vec::new();

  for (query, row) in logits.outer_iter().enumerate() {
    let probs: Vec<f32> = row.iter().take(num_tokens).map(|v| sigmoid(*v)).collect();
    let score = probs.iter().copied().fold(0.0f32, f32::max);
    if score <= thresholds.box_threshold || score <= thresholds.text_threshold {
      continue;
    }

    // 第一个位置是 [CLS]
    let tokens: Vec<usize> = probs
      .iter()
      .enumerate()
      .skip(1)
      .filter(|(_, p)| **p > thresholds.text_threshold)
      .map(|(i, _)| i)
      .collect();

    let b = boxes.row(query);
    candidates.push(Candidate {
      bbox: CxCyWh::new(b[0], b[1], b[2], b[3]),
      score,
      tokens,
    });
  }

  candidates
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}
