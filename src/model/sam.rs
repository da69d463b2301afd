// 该文件是 Grounded-SAM 项目的一部分。
// src/model/sam.rs - Segment Anything 框提示分割
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
  ops::Range,
  path::{Path, PathBuf},
};

use ndarray::{Array1, Array2, Array3, Array4, ArrayD, ArrayView2, ArrayView4, Ix2, Ix4, s};
use ort::{
  session::Session,
  value::{DynValue, Tensor},
};
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  boxes::{ResizeLongestSide, XyXy},
  device::Device,
  frame::{Normalize, RgbFrame},
  model::{
    Mask, MaskSet, Segment,
    session::{IoSignature, LoadPolicy, SessionBuilder, SessionError, check_signature},
  },
  utils::url_file_path,
};

const ENCODER_INPUT: &str = "image";
const ENCODER_OUTPUT: &str = "image_embeddings";

const DECODER_EMBEDDINGS: &str = "image_embeddings";
const DECODER_POINT_COORDS: &str = "point_coords";
const DECODER_POINT_LABELS: &str = "point_labels";
const DECODER_MASK_INPUT: &str = "mask_input";
const DECODER_HAS_MASK_INPUT: &str = "has_mask_input";
const DECODER_ORIG_SIZE: &str = "orig_im_size";
const DECODER_MASKS: &str = "masks";
const DECODER_IOU: &str = "iou_predictions";
const DECODER_LOW_RES: &str = "low_res_masks";

const ENCODER_SIGNATURE: IoSignature = IoSignature {
  inputs: &[ENCODER_INPUT],
  outputs: &[ENCODER_OUTPUT],
};

const DECODER_SIGNATURE: IoSignature = IoSignature {
  inputs: &[
    DECODER_EMBEDDINGS,
    DECODER_POINT_COORDS,
    DECODER_POINT_LABELS,
    DECODER_MASK_INPUT,
    DECODER_HAS_MASK_INPUT,
    DECODER_ORIG_SIZE,
  ],
  outputs: &[DECODER_MASKS, DECODER_IOU, DECODER_LOW_RES],
};

/// 框的左上、右下角点在提示中的标签
const BOX_CORNER_LABELS: [f32; 2] = [2.0, 3.0];
const LOW_RES_MASK_SIZE: usize = 256;
const MASK_THRESHOLD: f32 = 0.0;

const SAM_NORMALIZE: Normalize = Normalize {
  rescale: 1.0,
  mean: [123.675, 116.28, 103.53],
  std: [58.395, 57.12, 57.375],
};

#[derive(Error, Debug)]
pub enum SamError {
  #[error("URI schema mismatch: {0}")]
  SchemaMismatch(String),
  #[error("SAM 权重文件不存在: {0}")]
  CheckpointNotFound(PathBuf),
  #[error("无法从 {0} 推断解码器路径，请通过 decoder 参数指定")]
  DecoderUnknown(PathBuf),
  #[error("无效的加载策略: {0}")]
  InvalidPolicy(String),
  #[error("SAM 模型结构不匹配: {0}")]
  Incompatible(#[source] SessionError),
  #[error("会话错误: {0}")]
  Session(#[source] SessionError),
  #[error("尚未调用 set_image")]
  ImageNotSet,
  #[error("掩码尺寸 {actual:?} 与图像尺寸 {expected:?} 不一致")]
  MaskShape {
    expected: (usize, usize),
    actual: (usize, usize),
  },
  #[error("推理错误: {0}")]
  Inference(String),
}

impl From<SessionError> for SamError {
  fn from(e: SessionError) -> Self {
    match e {
      e @ SessionError::Incompatible { .. } => SamError::Incompatible(e),
      SessionError::NotFound(path) => SamError::CheckpointNotFound(path),
      other => SamError::Session(other),
    }
  }
}

impl SamError {
  fn inference(e: impl std::fmt::Display) -> Self {
    SamError::Inference(e.to_string())
  }
}

/// 由编码器路径推断解码器路径：文件名中的 `encoder` 替换为 `decoder`
pub fn derive_decoder_path(encoder: &Path) -> Option<PathBuf> {
  let name = encoder.file_name()?.to_str()?;
  if !name.contains("encoder") {
    return None;
  }
  Some(encoder.with_file_name(name.replace("encoder", "decoder")))
}

pub struct SamBuilder {
  encoder: PathBuf,
  decoder: Option<PathBuf>,
  device: Device,
  policy: LoadPolicy,
  num_threads: usize,
}

impl FromUrlWithScheme for SamBuilder {
  const SCHEME: &'static str = "sam";
}

impl FromUrl for SamBuilder {
  type Error = SamError;

  /// `sam:///path/to/vit_h.encoder.onnx?decoder=/path/to/vit_h.decoder.onnx&policy=strict`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(SamError::SchemaMismatch(url.scheme().to_string()));
    }

    let mut builder = SamBuilder::new(url_file_path(url));
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "decoder" => builder.decoder = Some(PathBuf::from(v.as_ref())),
        "policy" => builder.policy = v.parse().map_err(SamError::InvalidPolicy)?,
        _ => {}
      }
    }
    Ok(builder)
  }
}

impl SamBuilder {
  pub fn new(encoder: impl AsRef<Path>) -> Self {
    Self {
      encoder: encoder.as_ref().to_path_buf(),
      decoder: None,
      device: Device::default(),
      policy: LoadPolicy::Strict,
      num_threads: 4,
    }
  }

  pub fn decoder(mut self, decoder: impl AsRef<Path>) -> Self {
    self.decoder = Some(decoder.as_ref().to_path_buf());
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

  fn decoder_path(&self) -> Result<PathBuf, SamError> {
    match &self.decoder {
      Some(path) => Ok(path.clone()),
      None => derive_decoder_path(&self.encoder)
        .ok_or_else(|| SamError::DecoderUnknown(self.encoder.clone())),
    }
  }

  pub fn build(self) -> Result<SamPredictor, SamError> {
    if !self.encoder.exists() {
      return Err(SamError::CheckpointNotFound(self.encoder));
    }
    let decoder_path = self.decoder_path()?;
    if !decoder_path.exists() {
      return Err(SamError::CheckpointNotFound(decoder_path));
    }

    let encoder = SessionBuilder::new(&self.encoder)
      .device(self.device)
      .num_threads(self.num_threads)
      .build()?;
    check_signature(&encoder, "sam-encoder", &ENCODER_SIGNATURE, self.policy)?;

    let decoder = SessionBuilder::new(&decoder_path)
      .device(self.device)
      .num_threads(self.num_threads)
      .build()?;
    check_signature(&decoder, "sam-decoder", &DECODER_SIGNATURE, self.policy)?;

    info!("SAM 加载完成 ({} 策略)", self.policy);
    Ok(SamPredictor {
      encoder,
      decoder,
      transform: ResizeLongestSide::default(),
      embedding: None,
    })
  }
}

/// 当前图像的嵌入，以及原图 `(高, 宽)`
#[derive(Debug)]
struct ImageEmbedding {
  data: ArrayD<f32>,
  height: u32,
  width: u32,
}

/// 先对整张图编码一次，再对每个框分别解码
#[derive(Debug)]
pub struct SamPredictor {
  encoder: Session,
  decoder: Session,
  transform: ResizeLongestSide,
  embedding: Option<ImageEmbedding>,
}

impl SamPredictor {
  fn decode_box(
    decoder: &mut Session,
    embedding: &ImageEmbedding,
    b: &XyXy,
    multimask: bool,
  ) -> Result<MaskSet, SamError> {
    let (height, width) = (embedding.height, embedding.width);

    let point_coords = Array3::from_shape_vec((1, 2, 2), vec![b.x1, b.y1, b.x2, b.y2])
      .map_err(SamError::inference)?;
    let point_labels =
      Array2::from_shape_vec((1, 2), BOX_CORNER_LABELS.to_vec()).map_err(SamError::inference)?;
    let mask_input = Array4::<f32>::zeros((1, 1, LOW_RES_MASK_SIZE, LOW_RES_MASK_SIZE));
    let has_mask_input = Array1::<f32>::zeros(1);
    let orig_im_size = Array1::from_vec(vec![height as f32, width as f32]);

    let inputs: Vec<(&str, DynValue)> = vec![
      (DECODER_EMBEDDINGS, dyn_tensor(embedding.data.clone())?),
      (DECODER_POINT_COORDS, dyn_tensor(point_coords)?),
      (DECODER_POINT_LABELS, dyn_tensor(point_labels)?),
      (DECODER_MASK_INPUT, dyn_tensor(mask_input)?),
      (DECODER_HAS_MASK_INPUT, dyn_tensor(has_mask_input)?),
      (DECODER_ORIG_SIZE, dyn_tensor(orig_im_size)?),
    ];

    let outputs = decoder.run(inputs).map_err(SamError::inference)?;
    let masks = outputs
      .get(DECODER_MASKS)
      .ok_or_else(|| SessionError::MissingOutput(DECODER_MASKS.to_string()))?
      .try_extract_array::<f32>()
      .map_err(SamError::inference)?
      .into_dimensionality::<Ix4>()
      .map_err(SamError::inference)?
      .to_owned();
    let iou = outputs
      .get(DECODER_IOU)
      .ok_or_else(|| SessionError::MissingOutput(DECODER_IOU.to_string()))?
      .try_extract_array::<f32>()
      .map_err(SamError::inference)?
      .into_dimensionality::<Ix2>()
      .map_err(SamError::inference)?
      .to_owned();

    masks_from_logits(
      masks.view(),
      iou.view(),
      multimask,
      (height as usize, width as usize),
    )
  }
}

impl Segment for SamPredictor {
  type Error = SamError;

  fn transform(&self) -> ResizeLongestSide {
    self.transform
  }

  fn set_image(&mut self, frame: &RgbFrame) -> Result<(), Self::Error> {
    let (height, width) = (frame.height(), frame.width());
    let (new_h, new_w) = self.transform.preprocess_shape(height, width);
    let side = self.transform.target_length;
    debug!("SAM 输入: {}x{} -> {}x{}，填充至 {}", width, height, new_w, new_h, side);

    let tensor = frame.to_nchw_tensor((new_w, new_h), (side, side), &SAM_NORMALIZE);
    let inputs: Vec<(&str, DynValue)> = vec![(ENCODER_INPUT, dyn_tensor(tensor)?)];

    let now = std::time::Instant::now();
    let outputs = self.encoder.run(inputs).map_err(SamError::inference)?;
    let data = outputs
      .get(ENCODER_OUTPUT)
      .ok_or_else(|| SessionError::MissingOutput(ENCODER_OUTPUT.to_string()))?
      .try_extract_array::<f32>()
      .map_err(SamError::inference)?
      .to_owned();
    info!("图像编码完成，耗时 {:.2?}，嵌入形状 {:?}", now.elapsed(), data.shape());

    self.embedding = Some(ImageEmbedding {
      data,
      height,
      width,
    });
    Ok(())
  }

  fn predict_boxes(&mut self, boxes: &[XyXy], multimask: bool) -> Result<Vec<MaskSet>, Self::Error> {
    let decoder = &mut self.decoder;
    decode_each(self.embedding.as_ref(), boxes, |embedding, b| {
      SamPredictor::decode_box(decoder, embedding, b, multimask)
    })
  }
}

/// 对每个框依次解码；没有嵌入时直接报错，没有框时不调用解码器
fn decode_each<F>(
  embedding: Option<&ImageEmbedding>,
  boxes: &[XyXy],
  mut decode: F,
) -> Result<Vec<MaskSet>, SamError>
where
  F: FnMut(&ImageEmbedding, &XyXy) -> Result<MaskSet, SamError>,
{
  let embedding = embedding.ok_or(SamError::ImageNotSet)?;

  let mut sets = Vec::with_capacity(boxes.len());
  for (i, b) in boxes.iter().enumerate() {
    let now = std::time::Instant::now();
    let set = decode(embedding, b)?;
    debug!(
      "框 {} {:?}: {} 个掩码，IoU {:?}，耗时 {:.2?}",
      i,
      b.as_array(),
      set.len(),
      set.scores,
      now.elapsed()
    );
    sets.push(set);
  }
  Ok(sets)
}

fn dyn_tensor<D>(array: ndarray::Array<f32, D>) -> Result<DynValue, SamError>
where
  D: ndarray::Dimension + 'static,
{
  Tensor::from_array(array)
    .map(|t| t.into_dyn())
    .map_err(SamError::inference)
}

/// 解码器输出通道中要保留的部分
///
/// 多掩码导出的第 0 通道是单掩码结果，多掩码模式取最后 3 个。
pub fn select_channels(num_channels: usize, multimask: bool) -> Range<usize> {
  match (multimask, num_channels) {
    (_, 0) => 0..0,
    (true, n) if n > 3 => (n - 3)..n,
    (true, n) => 0..n,
    (false, _) => 0..1,
  }
}

/// `logits` 形状为 `[1, C, H, W]`，`iou` 为 `[1, C]`
fn masks_from_logits(
  logits: ArrayView4<f32>,
  iou: ArrayView2<f32>,
  multimask: bool,
  expected: (usize, usize),
) -> Result<MaskSet, SamError> {
  let actual = (logits.shape()[2], logits.shape()[3]);
  if actual != expected {
    return Err(SamError::MaskShape { expected, actual });
  }

  let mut set = MaskSet::default();
  for c in select_channels(logits.shape()[1], multimask) {
    let data = logits.slice(s![0, c, .., ..]).mapv(|v| v > MASK_THRESHOLD);
    set.masks.push(Mask::from(data));
    set.scores.push(iou.get([0, c]).copied().unwrap_or_default());
  }
  Ok(set)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decoder_path_is_derived_from_encoder() {
    assert_eq!(
      derive_decoder_path(Path::new("/models/sam_vit_h_4b8939.encoder.onnx")),
      Some(PathBuf::from("/models/sam_vit_h_4b8939.decoder.onnx"))
    );
    assert_eq!(derive_decoder_path(Path::new("/models/sam.onnx")), None);
  }

  #[test]
  fn builder_from_url() {
    let url = Url::parse("sam:///models/vit_b.encoder.onnx?decoder=/other/dec.onnx&policy=tolerant")
      .unwrap();
    let builder = SamBuilder::from_url(&url).unwrap();
    assert_eq!(builder.encoder, PathBuf::from("/models/vit_b.encoder.onnx"));
    assert_eq!(builder.decoder_path().unwrap(), PathBuf::from("/other/dec.onnx"));
    assert_eq!(builder.policy, LoadPolicy::Tolerant);
  }

  #[test]
  fn builder_rejects_bad_policy_and_scheme() {
    let url = Url::parse("sam:///m.encoder.onnx?policy=loose").unwrap();
    assert!(matches!(
      SamBuilder::from_url(&url),
      Err(SamError::InvalidPolicy(_))
    ));
    let url = Url::parse("image:///m.encoder.onnx").unwrap();
    assert!(matches!(
      SamBuilder::from_url(&url),
      Err(SamError::SchemaMismatch(_))
    ));
  }

  #[test]
  fn missing_checkpoint() {
    let err = SamBuilder::new("/no/such/sam_vit_h.encoder.onnx")
      .device(Device::Cpu)
      .build()
      .unwrap_err();
    assert!(matches!(err, SamError::CheckpointNotFound(_)));
  }

  #[test]
  fn missing_decoder_next_to_existing_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let encoder = dir.path().join("sam.encoder.onnx");
    std::fs::write(&encoder, b"").unwrap();
    match SamBuilder::new(&encoder).build() {
      Err(SamError::CheckpointNotFound(path)) => {
        assert_eq!(path, dir.path().join("sam.decoder.onnx"))
      }
      Err(other) => panic!("unexpected error: {other}"),
      Ok(_) => panic!("decoder should be missing"),
    }
  }

  #[test]
  fn channel_selection() {
    assert_eq!(select_channels(4, true), 1..4);
    assert_eq!(select_channels(3, true), 0..3);
    assert_eq!(select_channels(4, false), 0..1);
    assert_eq!(select_channels(1, true), 0..1);
    assert_eq!(select_channels(0, false), 0..0);
  }

  #[test]
  fn logits_are_thresholded_at_zero() {
    let mut logits = Array4::<f32>::from_elem((1, 4, 3, 5), -1.0);
    logits[[0, 1, 0, 0]] = 0.5;
    logits[[0, 2, 2, 4]] = 0.0;
    logits[[0, 3, 1, 1]] = 3.0;
    let iou = Array2::from_shape_vec((1, 4), vec![0.1, 0.2, 0.3, 0.4]).unwrap();

    let set = masks_from_logits(logits.view(), iou.view(), true, (3, 5)).unwrap();
    assert_eq!(set.len(), 3);
    assert_eq!(set.scores, vec![0.2, 0.3, 0.4]);
    assert!(set.masks[0].get(0, 0));
    assert_eq!(set.masks[1].area(), 0);
    assert!(set.masks[2].get(1, 1));
    assert_eq!((set.masks[0].height(), set.masks[0].width()), (3, 5));

    let single = masks_from_logits(logits.view(), iou.view(), false, (3, 5)).unwrap();
    assert_eq!(single.len(), 1);
    assert_eq!(single.masks[0].area(), 0);
  }

  #[test]
  fn mask_shape_mismatch_is_an_error() {
    let logits = Array4::<f32>::zeros((1, 3, 4, 4));
    let iou = Array2::<f32>::zeros((1, 3));
    assert!(matches!(
      masks_from_logits(logits.view(), iou.view(), true, (480, 640)),
      Err(SamError::MaskShape { .. })
    ));
  }

  fn embedding(height: u32, width: u32) -> ImageEmbedding {
    ImageEmbedding {
      data: ArrayD::zeros(vec![1, 256, 64, 64]),
      height,
      width,
    }
  }

  #[test]
  fn boxes_before_set_image_are_rejected() {
    let mut calls = 0;
    let result = decode_each(None, &[XyXy::new(0.0, 0.0, 10.0, 10.0)], |_, _| {
      calls += 1;
      Ok(MaskSet::default())
    });
    assert!(matches!(result, Err(SamError::ImageNotSet)));
    assert_eq!(calls, 0);
  }

  #[test]
  fn no_boxes_never_reach_the_decoder() {
    let embedding = embedding(480, 640);
    let mut calls = 0;
    let sets = decode_each(Some(&embedding), &[], |_, _| {
      calls += 1;
      Ok(MaskSet::default())
    })
    .unwrap();
    assert!(sets.is_empty());
    assert_eq!(calls, 0);
  }

  #[test]
  fn each_box_is_decoded_in_order() {
    let embedding = embedding(480, 640);
    let boxes = [
      XyXy::new(0.0, 0.0, 10.0, 10.0),
      XyXy::new(5.0, 5.0, 20.0, 30.0),
    ];
    let mut seen = Vec::new();
    let sets = decode_each(Some(&embedding), &boxes, |e, b| {
      assert_eq!((e.height, e.width), (480, 640));
      seen.push(*b);
      Ok(MaskSet {
        masks: vec![Mask::empty(480, 640)],
        scores: vec![b.x2],
      })
    })
    .unwrap();
    assert_eq!(seen, boxes.to_vec());
    assert_eq!(sets.len(), 2);
    assert_eq!(sets[1].scores, vec![20.0]);
  }
}
