/// YOLOv8 后处理模块: DFL解码 → 过滤 → 目标类别筛选 → NMS
/// 输入为引擎的6个原始张量 [box0, cls0, box1, cls1, box2, cls2]
///
/// 解码输出在模型输入空间 (IMG_SIZE x IMG_SIZE), 坐标还原由上层负责。
/// 输出顺序仅为NMS保留序, 调用方不得依赖空间或类别排序。
use ndarray::Array4;

use crate::config::{self, IMG_SIZE, NMS_THRESH, OBJ_THRESH};
use crate::engine::{self, BRANCHES};
use crate::{non_max_suppression, Bbox};

/// 后处理错误 (单帧级, 不致命)
#[derive(Debug, thiserror::Error)]
#[error("postprocess failed: {0}")]
pub struct DecodeError(pub String);

/// YOLOv8 后处理器
pub struct Yolov8Postprocessor {
    img_size: u32,
    conf_threshold: f32,
    iou_threshold: f32,
}

impl Default for Yolov8Postprocessor {
    fn default() -> Self {
        Self::new(OBJ_THRESH, NMS_THRESH)
    }
}

impl Yolov8Postprocessor {
    pub fn new(conf_threshold: f32, iou_threshold: f32) -> Self {
        Self {
            img_size: IMG_SIZE,
            conf_threshold,
            iou_threshold,
        }
    }

    pub fn conf_threshold(&self) -> f32 {
        self.conf_threshold
    }

    /// DFL解码: (1, 4*mc, h, w) 分布张量 → (1, 4, h, w) 连续偏移
    ///
    /// 每条边在mc个bin上做数值稳定softmax, 偏移为bin序号的期望值。
    fn dfl(&self, position: &Array4<f32>) -> Array4<f32> {
        let (_, c, h, w) = position.dim();
        let mc = c / 4;
        let mut out = Array4::<f32>::zeros((1, 4, h, w));
        for side in 0..4 {
            for y in 0..h {
                for x in 0..w {
                    let mut max_v = f32::NEG_INFINITY;
                    for b in 0..mc {
                        max_v = max_v.max(position[[0, side * mc + b, y, x]]);
                    }
                    let mut sum = 0.0f32;
                    let mut acc = 0.0f32;
                    for b in 0..mc {
                        let e = (position[[0, side * mc + b, y, x]] - max_v).exp();
                        sum += e;
                        acc += e * b as f32;
                    }
                    out[[0, side, y, x]] = acc / sum;
                }
            }
        }
        out
    }

    /// 偏移转绝对坐标: (cell中心 ∓ 偏移) * stride → (1, 4, h, w) xyxy
    fn box_process(&self, position: &Array4<f32>) -> Array4<f32> {
        let (_, _, h, w) = position.dim();
        let stride_x = self.img_size as f32 / w as f32;
        let stride_y = self.img_size as f32 / h as f32;
        let offsets = self.dfl(position);
        let mut xyxy = Array4::<f32>::zeros((1, 4, h, w));
        for y in 0..h {
            for x in 0..w {
                let cx = x as f32 + 0.5;
                let cy = y as f32 + 0.5;
                xyxy[[0, 0, y, x]] = (cx - offsets[[0, 0, y, x]]) * stride_x;
                xyxy[[0, 1, y, x]] = (cy - offsets[[0, 1, y, x]]) * stride_y;
                xyxy[[0, 2, y, x]] = (cx + offsets[[0, 2, y, x]]) * stride_x;
                xyxy[[0, 3, y, x]] = (cy + offsets[[0, 3, y, x]]) * stride_y;
            }
        }
        xyxy
    }

    /// 三分支解码 → 过滤 → 目标类别筛选 → 全集NMS
    ///
    /// 无目标时返回空列表, 不是错误。
    pub fn decode(&self, outputs: &[Array4<f32>]) -> Result<Vec<Bbox>, DecodeError> {
        engine::validate_raw_outputs(outputs).map_err(|e| DecodeError(e.to_string()))?;

        let mut candidates: Vec<Bbox> = Vec::new();
        for branch in 0..BRANCHES {
            let position = &outputs[2 * branch];
            let classes = &outputs[2 * branch + 1];
            let (_, nc, h, w) = classes.dim();
            let xyxy = self.box_process(position);

            // 展平顺序与分支顺序固定 (NHWC), 同分候选的胜负由此决定
            for y in 0..h {
                for x in 0..w {
                    // 本模型无独立objectness分支, 置信度恒取1.0
                    let objectness = 1.0f32;
                    let (id, best) = (0..nc)
                        .map(|c| (c, classes[[0, c, y, x]]))
                        .reduce(|max, v| if v.1 > max.1 { v } else { max })
                        .unwrap();
                    let score = best * objectness;
                    if score < self.conf_threshold {
                        continue;
                    }
                    let name = match config::class_name(id) {
                        Some(n) => n,
                        None => continue, // 类别越界, 丢弃该候选
                    };
                    if !config::is_target_class(name) {
                        continue;
                    }
                    candidates.push(Bbox::new_from_xyxy(
                        xyxy[[0, 0, y, x]],
                        xyxy[[0, 1, y, x]],
                        xyxy[[0, 2, y, x]],
                        xyxy[[0, 3, y, x]],
                        id,
                        score,
                    ));
                }
            }
        }

        non_max_suppression(&mut candidates, self.iou_threshold);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CLASSES;
    use crate::engine::{DFL_BINS, InferenceEngine, StubEngine};

    fn class_id(name: &str) -> usize {
        CLASSES.iter().position(|c| *c == name).unwrap()
    }

    /// 全背景输出: 三分支占位张量
    fn background_outputs() -> Vec<Array4<f32>> {
        StubEngine::new(640, CLASSES.len())
            .infer(&Array4::zeros((1, 3, 640, 640)))
            .unwrap()
    }

    /// 在分支`branch`的cell(y,x)放一个目标: 分布质量集中在bin k, 类别置信度conf
    fn plant_detection(
        outputs: &mut [Array4<f32>],
        branch: usize,
        y: usize,
        x: usize,
        bin: usize,
        id: usize,
        conf: f32,
    ) {
        for side in 0..4 {
            outputs[2 * branch][[0, side * DFL_BINS + bin, y, x]] = 50.0;
        }
        outputs[2 * branch + 1][[0, id, y, x]] = conf;
    }

    #[test]
    fn test_dfl_mass_on_bin_k_decodes_to_k() {
        let pp = Yolov8Postprocessor::default();
        let mut position = Array4::<f32>::zeros((1, 4 * DFL_BINS, 1, 1));
        for (side, k) in [(0usize, 3usize), (1, 7), (2, 0), (3, 15)] {
            position[[0, side * DFL_BINS + k, 0, 0]] = 50.0;
        }
        let offsets = pp.dfl(&position);
        assert!((offsets[[0, 0, 0, 0]] - 3.0).abs() < 1e-3);
        assert!((offsets[[0, 1, 0, 0]] - 7.0).abs() < 1e-3);
        assert!(offsets[[0, 2, 0, 0]].abs() < 1e-3);
        assert!((offsets[[0, 3, 0, 0]] - 15.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_all_background_is_empty_not_error() {
        let pp = Yolov8Postprocessor::default();
        let boxes = pp.decode(&background_outputs()).unwrap();
        assert!(boxes.is_empty());
    }

    #[test]
    fn test_decode_single_person() {
        let pp = Yolov8Postprocessor::default();
        let mut outputs = background_outputs();
        // 细分支(stride 32), cell(1,1), 偏移2 → 框(1.5∓2)*32
        plant_detection(&mut outputs, 2, 1, 1, 2, class_id("person"), 0.9);
        let boxes = pp.decode(&outputs).unwrap();
        assert_eq!(boxes.len(), 1);
        let b = &boxes[0];
        assert_eq!(b.id(), class_id("person"));
        assert!((b.confidence() - 0.9).abs() < 1e-5);
        assert!((b.xmin() - (1.5 - 2.0) * 32.0).abs() < 0.1);
        assert!((b.xmax() - (1.5 + 2.0) * 32.0).abs() < 0.1);
        assert!(b.xmin() < b.xmax() && b.ymin() < b.ymax());
    }

    #[test]
    fn test_decode_below_threshold_filtered() {
        let pp = Yolov8Postprocessor::default();
        let mut outputs = background_outputs();
        plant_detection(&mut outputs, 2, 1, 1, 2, class_id("person"), 0.29);
        assert!(pp.decode(&outputs).unwrap().is_empty());
    }

    #[test]
    fn test_decode_non_target_class_discarded() {
        let pp = Yolov8Postprocessor::default();
        let mut outputs = background_outputs();
        plant_detection(&mut outputs, 2, 1, 1, 2, class_id("car"), 0.95);
        assert!(pp.decode(&outputs).unwrap().is_empty());
    }

    #[test]
    fn test_decode_cross_class_suppression() {
        // head和face重叠时按全集NMS互相抑制 (保留高分)
        let pp = Yolov8Postprocessor::default();
        let mut outputs = background_outputs();
        plant_detection(&mut outputs, 2, 5, 5, 2, class_id("head"), 0.8);
        plant_detection(&mut outputs, 1, 11, 11, 4, class_id("face"), 0.6); // stride16, 同区域
        let boxes = pp.decode(&outputs).unwrap();
        // cell(5,5)@32 中心176, 半宽2*32=64; cell(11,11)@16 中心184, 半宽64: IoU很高
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].id(), class_id("head"));
    }

    #[test]
    fn test_decode_rejects_bad_layout() {
        let pp = Yolov8Postprocessor::default();
        let outputs = vec![Array4::zeros((1, 64, 80, 80))];
        assert!(pp.decode(&outputs).is_err());
    }
}
