#![allow(clippy::type_complexity)]
pub mod annotate; // 标注绘制 (画框/标签/距离文本)
pub mod config; // 阈值常量与命令行参数
pub mod engine; // NPU推理引擎边界 (opaque inference boundary)
pub mod pool; // 有序多线程推理池
pub mod postprocess; // YOLOv8 DFL解码 + NMS
pub mod processor; // 单帧处理任务 (preprocess → infer → decode → estimate → draw)
pub mod proximity; // 距离估算与电子警戒
pub mod session; // 会话生命周期 (token/slot/pool/sink)
pub mod source; // 帧源与采集线程
pub mod stream; // RTSP推流队列 (lossy)
pub mod sync; // 取消令牌 + 最新帧槽位

pub use crate::config::Args;
pub use crate::engine::{EngineError, InferenceEngine, StubEngine};
pub use crate::pool::{FrameOutput, InferencePool};
pub use crate::postprocess::Yolov8Postprocessor;
pub use crate::processor::{FrameProcessor, PipelineError, Yolov8Processor};
pub use crate::proximity::{AlertEvent, ProximityEstimator, ProximityResult, Range};
pub use crate::stream::StreamingSink;
pub use crate::sync::{CancelToken, LatestSlot};

use std::time::Instant;

/// 一帧图像 (RGB24, 行优先)
///
/// 序号在提交到推理池时分配, 采集阶段恒为0。
/// 所有权随流水线阶段转移, 需要跨阶段保留数据时显式clone。
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub seq: u64,
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), (width * height * 3) as usize);
        Self {
            data,
            width,
            height,
            seq: 0,
            captured_at: Instant::now(),
        }
    }

    /// 像素字节数 (width * height * 3)
    pub fn byte_len(&self) -> usize {
        (self.width * self.height * 3) as usize
    }
}

/// 检测框 (模型输入空间或原图空间, 视所处阶段而定)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    id: usize,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, id: usize, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            id,
            confidence,
        }
    }

    pub fn new_from_xyxy(x1: f32, y1: f32, x2: f32, y2: f32, id: usize, confidence: f32) -> Self {
        Self::new(x1, y1, x2 - x1, y2 - y1, id, confidence)
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn width(&self) -> f32 {
        self.width
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        // 交叠边加1e-5, 避免零面积退化
        (r - l + 1e-5).max(0.) * (b - t + 1e-5).max(0.)
    }

    pub fn union(&self, another: &Bbox) -> f32 {
        self.area() + another.area() - self.intersection_area(another)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        self.intersection_area(another) / self.union(another)
    }
}

/// 贪心NMS (全类别混合抑制, 不分类别)
///
/// 稳定排序保证同分时序号靠前的框获胜。
pub fn non_max_suppression(xs: &mut Vec<Bbox>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.confidence().partial_cmp(&b1.confidence()).unwrap());

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

pub fn gen_time_string(delimiter: &str) -> String {
    let offset = chrono::FixedOffset::east_opt(8 * 60 * 60).unwrap(); // Beijing
    let t_now = chrono::Utc::now().with_timezone(&offset);
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    t_now.format(&fmt).to_string()
}
