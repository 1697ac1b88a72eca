/// 距离估算与电子警戒
/// Pinhole distance estimation plus the proximity alert rule
///
/// 估算规则: distance = real_height * focal_length / pixel_height (保留2位小数)。
/// 像素高度过小分两种去向: 低于1e-3为"不可靠"(不做除法),
/// 低于类别最小像素阈值为"too far"。两者都不是数值距离, 也都不是错误。
use crossbeam_channel::Sender;
use serde::Serialize;

use crate::config::{self, ALERT_DISTANCE, FOCAL_LENGTH};
use crate::{gen_time_string, Bbox};

/// 距离估算结果的三种状态
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Range {
    /// 有效距离 (米, 2位小数)
    Meters(f32),
    /// 像素高度低于类别可靠下限
    TooFar,
    /// 像素高度退化 (≤0 或 <1e-3), 不产生距离
    Unreliable,
}

impl Range {
    pub fn meters(&self) -> Option<f32> {
        match self {
            Range::Meters(d) => Some(*d),
            _ => None,
        }
    }
}

/// 单个检测的测距输出 (框为原图坐标)
#[derive(Debug, Clone)]
pub struct ProximityResult {
    pub bbox: Bbox,
    pub class_name: &'static str,
    pub range: Range,
    pub alert: bool,
}

/// 警戒事件 (旁路发出, 绝不阻塞流水线)
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub class_name: &'static str,
    pub distance: f32,
    pub frame_seq: u64,
    pub at: String,
}

/// 针孔模型测距, 退化输入返回None
pub fn calculate_distance(real_height: f32, focal_length: f32, pixel_height: f32) -> Option<f32> {
    if pixel_height <= 0.0 || pixel_height < 1e-3 {
        return None; // 防止除零
    }
    let distance = (real_height * focal_length) / pixel_height;
    Some((distance * 100.0).round() / 100.0)
}

/// 距离估算器
pub struct ProximityEstimator {
    focal_length: f32,
    alert_distance: f32,
    alerts: Option<Sender<AlertEvent>>,
}

impl Default for ProximityEstimator {
    fn default() -> Self {
        Self::new(FOCAL_LENGTH, ALERT_DISTANCE)
    }
}

impl ProximityEstimator {
    pub fn new(focal_length: f32, alert_distance: f32) -> Self {
        Self {
            focal_length,
            alert_distance,
            alerts: None,
        }
    }

    /// 挂载警戒事件通道 (无界, try_send失败直接丢弃事件)
    pub fn with_alert_channel(mut self, alerts: Sender<AlertEvent>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// 估算一个检测框的距离并判定警戒
    ///
    /// 类别未标定时返回None (调用方跳过)。
    pub fn estimate(
        &self,
        bbox: Bbox,
        class_name: &'static str,
        pixel_height: f32,
        frame_seq: u64,
    ) -> Option<ProximityResult> {
        let calib = config::TARGET_DIMENSIONS.get(class_name)?;

        let range = if pixel_height <= 0.0 || pixel_height < 1e-3 {
            Range::Unreliable
        } else if pixel_height < calib.min_pixel {
            Range::TooFar
        } else {
            match calculate_distance(calib.real_height, self.focal_length, pixel_height) {
                Some(d) => Range::Meters(d),
                None => Range::Unreliable,
            }
        };

        // 警戒判定: 严格小于阈值才触发, 恰好等于不触发
        let alert = matches!(range, Range::Meters(d) if d < self.alert_distance);
        if alert {
            if let (Range::Meters(distance), Some(tx)) = (range, self.alerts.as_ref()) {
                let _ = tx.try_send(AlertEvent {
                    class_name,
                    distance,
                    frame_seq,
                    at: gen_time_string("-"),
                });
            }
        }

        Some(ProximityResult {
            bbox,
            class_name,
            range,
            alert,
        })
    }
}
