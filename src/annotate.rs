/// 标注绘制: 检测框 + "类别 置信度 距离" 标签
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

use crate::proximity::{ProximityResult, Range};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const ALERT_BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_SCALE: f32 = 18.0;

/// 标注器: 字体缺失时降级为只画框
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self { font }
    }

    /// 从字体文件加载, 读取/解析失败打印警告并降级
    pub fn from_font_path(path: Option<&Path>) -> Self {
        let font = path.and_then(|p| match std::fs::read(p) {
            Ok(bytes) => match FontVec::try_from_vec(bytes) {
                Ok(f) => Some(f),
                Err(e) => {
                    eprintln!("⚠️  字体解析失败 {}: {}, 只画框不写字", p.display(), e);
                    None
                }
            },
            Err(e) => {
                eprintln!("⚠️  字体读取失败 {}: {}, 只画框不写字", p.display(), e);
                None
            }
        });
        Self { font }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// 在原图上绘制一个测距结果 (框坐标已是原图空间)
    pub fn draw(&self, image: &mut RgbImage, result: &ProximityResult, score: f32) {
        let x1 = result.bbox.xmin().round() as i32;
        let y1 = result.bbox.ymin().round() as i32;
        let w = result.bbox.width().round().max(1.0) as u32;
        let h = result.bbox.height().round().max(1.0) as u32;

        let color = if result.alert { ALERT_BOX_COLOR } else { BOX_COLOR };
        // 双层矩形模拟2px线宽
        draw_hollow_rect_mut(image, Rect::at(x1, y1).of_size(w, h), color);
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(image, Rect::at(x1 + 1, y1 + 1).of_size(w - 2, h - 2), color);
        }

        if let Some(font) = &self.font {
            let label = format_label(result, score);
            let ty = (y1 - LABEL_SCALE as i32 - 2).max(0);
            draw_text_mut(
                image,
                LABEL_COLOR,
                x1.max(0),
                ty,
                PxScale::from(LABEL_SCALE),
                font,
                &label,
            );
        }
    }
}

/// 标签文本: "Person 0.92 2.31m" / "Head 0.55 too far" / "Face 0.71 distance invalid"
fn format_label(result: &ProximityResult, score: f32) -> String {
    let suffix = match result.range {
        Range::Meters(d) => format!(" {}m", d),
        Range::TooFar => " too far".to_string(),
        Range::Unreliable => " distance invalid".to_string(),
    };
    format!("{} {:.2}{}", capitalize(result.class_name), score, suffix)
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
