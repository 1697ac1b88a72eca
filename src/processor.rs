/// 单帧处理任务: letterbox预处理 → 引擎推理 → 解码 → 测距 → 标注
/// Per-frame unit of work executed inside one pool worker
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

use crate::annotate::Annotator;
use crate::config::{self, IMG_SIZE};
use crate::engine::{EngineError, InferenceEngine};
use crate::postprocess::{DecodeError, Yolov8Postprocessor};
use crate::proximity::{ProximityEstimator, ProximityResult};
use crate::{Bbox, Frame};

/// 流水线单帧错误 (按失败种类区分; 单帧失败不拆除流水线)
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("invalid frame buffer ({width}x{height}, {len} bytes)")]
    BadFrame { width: u32, height: u32, len: usize },
}

/// 帧处理能力接口: 推理池对具体模型/引擎无感知
pub trait FrameProcessor: Send {
    /// 处理一帧: 就地标注, 返回测距结果 (空列表合法)
    fn process(&mut self, frame: &mut Frame) -> Result<Vec<ProximityResult>, PipelineError>;
}

/// letterbox几何参数, 用于坐标还原
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub ratio: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

/// 等比缩放+对称黑边填充到正方形
pub fn letterbox(img: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
    let (w0, h0) = img.dimensions();
    let r = (size as f32 / w0 as f32).min(size as f32 / h0 as f32);
    let new_w = ((w0 as f32 * r).round() as u32).max(1);
    let new_h = ((h0 as f32 * r).round() as u32).max(1);

    let resized = if (new_w, new_h) != (w0, h0) {
        imageops::resize(img, new_w, new_h, FilterType::Triangle)
    } else {
        img.clone()
    };

    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;
    let mut canvas = RgbImage::new(size, size);
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            ratio: r,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// RGB图 → NCHW f32批张量 (batch=1, /255归一化)
pub fn to_input_tensor(img: &RgbImage) -> Array4<f32> {
    let (w, h) = img.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in img.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        tensor[[0, 0, y as usize, x as usize]] = r as f32 / 255.0;
        tensor[[0, 1, y as usize, x as usize]] = g as f32 / 255.0;
        tensor[[0, 2, y as usize, x as usize]] = b as f32 / 255.0;
    }
    tensor
}

/// 模型输入空间框 → 原图空间框 (去padding, 除ratio, 夹取到图内)
pub fn map_to_original(bbox: &Bbox, meta: &Letterbox, width: u32, height: u32) -> Bbox {
    let unmap = |v: f32, pad: f32| (v - pad) / meta.ratio;
    let x1 = unmap(bbox.xmin(), meta.pad_x).clamp(0.0, width as f32);
    let y1 = unmap(bbox.ymin(), meta.pad_y).clamp(0.0, height as f32);
    let x2 = unmap(bbox.xmax(), meta.pad_x).clamp(0.0, width as f32);
    let y2 = unmap(bbox.ymax(), meta.pad_y).clamp(0.0, height as f32);
    Bbox::new_from_xyxy(x1, y1, x2, y2, bbox.id(), bbox.confidence())
}

/// YOLOv8处理器: 一个worker一个实例, 内部引擎独占加速器上下文
pub struct Yolov8Processor {
    engine: Box<dyn InferenceEngine>,
    postprocessor: Yolov8Postprocessor,
    estimator: ProximityEstimator,
    annotator: Annotator,
    img_size: u32,
}

impl Yolov8Processor {
    pub fn new(
        engine: Box<dyn InferenceEngine>,
        postprocessor: Yolov8Postprocessor,
        estimator: ProximityEstimator,
        annotator: Annotator,
    ) -> Self {
        Self {
            engine,
            postprocessor,
            estimator,
            annotator,
            img_size: IMG_SIZE,
        }
    }
}

impl FrameProcessor for Yolov8Processor {
    fn process(&mut self, frame: &mut Frame) -> Result<Vec<ProximityResult>, PipelineError> {
        let (width, height, seq) = (frame.width, frame.height, frame.seq);
        let data = std::mem::take(&mut frame.data);
        let len = data.len();
        let mut image = RgbImage::from_raw(width, height, data).ok_or(PipelineError::BadFrame {
            width,
            height,
            len,
        })?;

        // 预处理 → 推理 → 解码 (出错时把像素还给frame再返回错误)
        let decoded = (|| {
            let (input_img, meta) = letterbox(&image, self.img_size);
            let input = to_input_tensor(&input_img);
            let outputs = self.engine.infer(&input)?;
            let boxes = self.postprocessor.decode(&outputs)?;
            Ok::<_, PipelineError>((boxes, meta))
        })();
        let (boxes, meta) = match decoded {
            Ok(v) => v,
            Err(e) => {
                frame.data = image.into_raw();
                return Err(e);
            }
        };

        let mut results = Vec::with_capacity(boxes.len());
        for bbox in &boxes {
            let name = match config::class_name(bbox.id()) {
                Some(n) => n,
                None => continue,
            };
            let orig = map_to_original(bbox, &meta, width, height);
            let pixel_height = orig.height();
            if let Some(result) = self.estimator.estimate(orig, name, pixel_height, seq) {
                self.annotator.draw(&mut image, &result, bbox.confidence());
                results.push(result);
            }
        }

        frame.data = image.into_raw();
        Ok(results)
    }
}
