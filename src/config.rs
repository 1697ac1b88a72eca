/// 阈值常量与命令行参数
/// Detection thresholds, calibration tables and CLI arguments
use clap::Parser;
use once_cell::sync::Lazy;
use std::path::PathBuf;

/// 目标置信度阈值
pub const OBJ_THRESH: f32 = 0.3;
/// NMS IoU阈值
pub const NMS_THRESH: f32 = 0.45;
/// 模型输入尺寸 (需与模型匹配)
pub const IMG_SIZE: u32 = 640;
/// 电子警戒触发距离阈值 (米)
pub const ALERT_DISTANCE: f32 = 3.0;
/// 像素焦距 (公式: f = pixel_height * distance / real_height, 需标定)
pub const FOCAL_LENGTH: f32 = 800.0;
/// 推流队列容量 (平衡内存和延迟)
pub const STREAM_QUEUE_CAP: usize = 8;
/// 默认推理线程数, 与RK3588的3核NPU对齐, 避免资源争抢
pub const DEFAULT_WORKERS: usize = 3;

/// 模型类别列表
pub const CLASSES: [&str; 53] = [
    "0",
    "1",
    "2",
    "Bicycle",
    "Bike",
    "Car",
    "Cyclist",
    "Pedestrian",
    "Pedestrians",
    "Persona",
    "Pessoa",
    "Signboard",
    "Stopper",
    "aeroplane",
    "bag",
    "berdiri",
    "bicycle",
    "bird",
    "boat",
    "bottle",
    "bus",
    "car",
    "cat",
    "chair",
    "cow",
    "cyclist",
    "dianzhuan",
    "diningtable",
    "dog",
    "face",
    "forklift",
    "handbag",
    "head",
    "helmet",
    "high",
    "horse",
    "jatuh",
    "laptop",
    "low",
    "medium",
    "motorbike",
    "people",
    "person",
    "persons",
    "pottedplant",
    "refrigerator",
    "sheep",
    "sofa",
    "teddy bear",
    "train",
    "tv",
    "tvmonitor",
    "vase",
];

/// 小写类别名 (过滤时统一小写比较)
pub static LOWER_CLASSES: Lazy<Vec<String>> =
    Lazy::new(|| CLASSES.iter().map(|c| c.to_lowercase()).collect());

/// 单类别标定参数
#[derive(Debug, Clone, Copy)]
pub struct ClassCalibration {
    /// 实际高度 (米)
    pub real_height: f32,
    /// 最小可靠像素高度, 低于此值视为"too far"
    pub min_pixel: f32,
}

/// 目标类别实际尺寸配置 (需根据实际相机校准)
pub static TARGET_DIMENSIONS: phf::Map<&'static str, ClassCalibration> = phf::phf_map! {
    "person" => ClassCalibration { real_height: 1.7, min_pixel: 30.0 }, // 人-平均身高
    "head"   => ClassCalibration { real_height: 0.2, min_pixel: 15.0 }, // 头-平均高度
    "face"   => ClassCalibration { real_height: 0.2, min_pixel: 15.0 }, // 人脸-平均高度
};

/// 类别是否在警戒目标集合内 (person/head/face)
pub fn is_target_class(lower_name: &str) -> bool {
    TARGET_DIMENSIONS.contains_key(lower_name)
}

/// 按类别ID取小写类别名, 越界返回None
pub fn class_name(id: usize) -> Option<&'static str> {
    LOWER_CLASSES.get(id).map(|s| s.as_str())
}

/// 电子警戒参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "电子警戒 - 多线程NPU视频推理与距离报警", long_about = None)]
pub struct Args {
    /// 图片序列目录 (不指定则使用内置合成画面)
    #[arg(short, long)]
    pub source: Option<PathBuf>,

    /// 推理线程数 (每线程独占一个NPU上下文)
    #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// 处理帧数上限 (0为不限制)
    #[arg(short, long, default_value_t = 300)]
    pub frames: u64,

    /// 采集帧率
    #[arg(long, default_value_t = 30.0)]
    pub fps: f32,

    /// 启用RTSP推流
    #[arg(long, default_value_t = false)]
    pub stream: bool,

    /// RTSP推流地址
    #[arg(long, default_value = "rtsp://127.0.0.1:8554/cam")]
    pub stream_url: String,

    /// 推流分辨率宽度
    #[arg(long, default_value_t = 480)]
    pub push_width: u32,

    /// 推流分辨率高度
    #[arg(long, default_value_t = 270)]
    pub push_height: u32,

    /// 推流帧率
    #[arg(long, default_value_t = 10)]
    pub push_fps: u32,

    /// 标签字体文件 (ttf/otf, 不指定则只画框不写字)
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// 置信度阈值
    #[arg(long, default_value_t = OBJ_THRESH)]
    pub conf: f32,

    /// NMS IoU阈值
    #[arg(long, default_value_t = NMS_THRESH)]
    pub iou: f32,
}
