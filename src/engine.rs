/// NPU推理引擎边界
/// Opaque inference-engine boundary: one narrow trait, no SDK details leak out
///
/// 真实部署时在这里接NPU SDK适配器 (每个实例独占一个加速器上下文,
/// 上下文不可跨线程共享)。张量布局之外的任何引擎细节都不进入解码/测距模块。
use ndarray::Array4;

/// 检测分支数 (粗/中/细三种stride)
pub const BRANCHES: usize = 3;
/// 原始输出张量数: 每分支一个box分布张量 + 一个类别置信度张量
pub const RAW_OUTPUTS: usize = BRANCHES * 2;
/// DFL分布bin数
pub const DFL_BINS: usize = 16;

/// 引擎错误 (按失败种类区分, 调用方决定是否致命)
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// 上下文创建/模型加载失败 — 对该worker是致命的
    #[error("engine init failed: {0}")]
    Init(String),

    /// 单次推理失败, 引擎返回错误码 — 按单帧失败处理
    #[error("inference failed with engine code 0x{0:x}")]
    Inference(i32),

    /// 输出张量布局不符合约定
    #[error("unexpected raw output layout: {0}")]
    BadOutput(String),
}

/// 推理引擎接口
///
/// 约定: 输入为一个预处理后的NCHW f32批张量 (batch=1),
/// 输出为恰好`RAW_OUTPUTS`个张量, 顺序 [box0, cls0, box1, cls1, box2, cls2]。
pub trait InferenceEngine: Send {
    /// 引擎标识 (日志用)
    fn name(&self) -> &'static str;

    /// 前向推理
    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<Array4<f32>>, EngineError>;

    /// 可选预热
    fn warm_up(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// 校验原始输出布局, 不符合约定返回`EngineError::BadOutput`
pub fn validate_raw_outputs(outputs: &[Array4<f32>]) -> Result<(), EngineError> {
    if outputs.len() != RAW_OUTPUTS {
        return Err(EngineError::BadOutput(format!(
            "expected {} tensors, got {}",
            RAW_OUTPUTS,
            outputs.len()
        )));
    }
    let mut num_classes = None;
    for branch in 0..BRANCHES {
        let position = &outputs[2 * branch];
        let classes = &outputs[2 * branch + 1];
        let (pn, pc, ph, pw) = position.dim();
        let (cn, cc, ch, cw) = classes.dim();
        if pn != 1 || cn != 1 {
            return Err(EngineError::BadOutput(format!(
                "branch {}: batch must be 1",
                branch
            )));
        }
        if pc % 4 != 0 {
            return Err(EngineError::BadOutput(format!(
                "branch {}: box channels {} not divisible by 4",
                branch, pc
            )));
        }
        if (ph, pw) != (ch, cw) {
            return Err(EngineError::BadOutput(format!(
                "branch {}: grid mismatch {}x{} vs {}x{}",
                branch, ph, pw, ch, cw
            )));
        }
        match num_classes {
            None => num_classes = Some(cc),
            Some(nc) if nc != cc => {
                return Err(EngineError::BadOutput(format!(
                    "branch {}: class channels {} != {}",
                    branch, cc, nc
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// 占位引擎: 输出全背景张量 (类别置信度全0)
///
/// 无加速器环境下跑通整条流水线用 (冒烟测试/CI),
/// 解码结果恒为空检测列表。
pub struct StubEngine {
    grids: [(usize, usize); BRANCHES],
    num_classes: usize,
}

impl StubEngine {
    pub fn new(img_size: u32, num_classes: usize) -> Self {
        // 三分支stride固定为8/16/32
        let s = img_size as usize;
        Self {
            grids: [(s / 8, s / 8), (s / 16, s / 16), (s / 32, s / 32)],
            num_classes,
        }
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, _input: &Array4<f32>) -> Result<Vec<Array4<f32>>, EngineError> {
        let mut outputs = Vec::with_capacity(RAW_OUTPUTS);
        for (grid_h, grid_w) in self.grids {
            outputs.push(Array4::zeros((1, 4 * DFL_BINS, grid_h, grid_w)));
            outputs.push(Array4::zeros((1, self.num_classes, grid_h, grid_w)));
        }
        Ok(outputs)
    }
}
