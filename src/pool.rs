/// 有序多线程推理池
/// Bounded worker pool that runs frames in parallel but hands results
/// back in strict submission order (the rknnPoolExecutor role)
///
/// 每个worker独占一个处理器实例 (即独占一个加速器上下文)。
/// 乱序完成的结果落入按序号索引的槽位表, retrieve只放行最小未取回序号。
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::processor::FrameProcessor;
use crate::proximity::ProximityResult;
use crate::sync::CancelToken;
use crate::Frame;

/// 一帧的最终输出 (标注后帧 + 测距结果)
///
/// `error`非空表示该帧处理失败, 调用方跳过显示/写出即可, 流水线继续。
/// worker异常退出导致帧丢失时`frame`为None。
pub struct FrameOutput {
    pub seq: u64,
    pub frame: Option<Frame>,
    pub detections: Vec<ProximityResult>,
    pub error: Option<String>,
}

impl FrameOutput {
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

enum Slot {
    Pending,
    Done(FrameOutput),
}

struct PoolState {
    slots: BTreeMap<u64, Slot>,
    next_out: u64,
    live_workers: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl Shared {
    fn complete(&self, seq: u64, output: FrameOutput) {
        let mut state = self.state.lock().unwrap();
        state.slots.insert(seq, Slot::Done(output));
        drop(state);
        self.cond.notify_all();
    }
}

/// worker退出守卫: 即使处理器panic也会递减存活计数, 避免retrieve永久阻塞
struct WorkerGuard(Arc<Shared>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap();
        state.live_workers -= 1;
        drop(state);
        self.0.cond.notify_all();
    }
}

/// 推理池
pub struct InferencePool {
    tx: Option<Sender<(u64, Frame)>>,
    shared: Arc<Shared>,
    token: CancelToken,
    handles: Vec<JoinHandle<()>>,
    next_seq: u64,
    workers: usize,
    released: bool,
}

impl InferencePool {
    /// 创建推理池
    ///
    /// 先为每个worker构建处理器, 任何一个失败则整体失败 (fail fast,
    /// 绝不缺员运行); 全部成功后才启动线程。
    pub fn new<F>(workers: usize, token: CancelToken, mut factory: F) -> anyhow::Result<Self>
    where
        F: FnMut(usize) -> anyhow::Result<Box<dyn FrameProcessor>>,
    {
        anyhow::ensure!(workers > 0, "推理池至少需要1个worker");

        let mut processors = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let processor = factory(worker_id)
                .map_err(|e| anyhow::anyhow!("worker {} 初始化失败: {}", worker_id, e))?;
            processors.push(processor);
        }

        // 积压上限 = 2*worker数, 满了submit阻塞形成背压
        let (tx, rx) = bounded::<(u64, Frame)>(workers * 2);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                slots: BTreeMap::new(),
                next_out: 0,
                live_workers: workers,
            }),
            cond: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(workers);
        for (worker_id, mut processor) in processors.into_iter().enumerate() {
            let rx = rx.clone();
            let shared = Arc::clone(&shared);
            let token = token.clone();
            let handle = thread::Builder::new()
                .name(format!("infer-{}", worker_id))
                .spawn(move || {
                    let _guard = WorkerGuard(Arc::clone(&shared));
                    loop {
                        match rx.recv_timeout(Duration::from_millis(100)) {
                            Ok((seq, mut frame)) => {
                                if token.is_cancelled() {
                                    // 停机: 已排队未开始的任务直接丢弃
                                    shared.complete(
                                        seq,
                                        FrameOutput {
                                            seq,
                                            frame: Some(frame),
                                            detections: Vec::new(),
                                            error: Some("discarded during shutdown".to_string()),
                                        },
                                    );
                                    continue;
                                }
                                let output = match processor.process(&mut frame) {
                                    Ok(detections) => FrameOutput {
                                        seq,
                                        frame: Some(frame),
                                        detections,
                                        error: None,
                                    },
                                    Err(e) => {
                                        eprintln!("⚠️  帧{}处理失败: {}", seq, e);
                                        FrameOutput {
                                            seq,
                                            frame: Some(frame),
                                            detections: Vec::new(),
                                            error: Some(e.to_string()),
                                        }
                                    }
                                };
                                shared.complete(seq, output);
                            }
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            shared,
            token,
            handles,
            next_seq: 0,
            workers,
            released: false,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 未取回的帧数 (在队列或在处理中)
    pub fn in_flight(&self) -> u64 {
        self.next_seq - self.shared.state.lock().unwrap().next_out
    }

    /// 提交一帧, 返回分配的序号
    ///
    /// 仅在积压达到上限时阻塞 (背压); worker全部退出时报错。
    pub fn submit(&mut self, mut frame: Frame) -> anyhow::Result<u64> {
        anyhow::ensure!(!self.released, "推理池已释放");
        let tx = match &self.tx {
            Some(tx) => tx,
            None => anyhow::bail!("推理池已释放"),
        };

        let seq = self.next_seq;
        frame.seq = seq;
        self.shared
            .state
            .lock()
            .unwrap()
            .slots
            .insert(seq, Slot::Pending);

        if tx.send((seq, frame)).is_err() {
            self.shared.state.lock().unwrap().slots.remove(&seq);
            anyhow::bail!("推理线程已全部退出, 无法提交帧");
        }
        self.next_seq += 1;
        Ok(seq)
    }

    /// 取回下一帧结果, 严格按提交顺序
    ///
    /// 阻塞直到最小未取回序号完成; 无未取回提交时返回None。
    /// 慢帧绝不会被后提交的快帧越过。
    pub fn retrieve(&mut self) -> Option<FrameOutput> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            let next = state.next_out;
            if next >= self.next_seq {
                return None;
            }
            let ready = matches!(state.slots.get(&next), Some(Slot::Done(_)));
            if ready {
                if let Some(Slot::Done(output)) = state.slots.remove(&next) {
                    state.next_out += 1;
                    return Some(output);
                }
                unreachable!("slot checked Done above");
            }
            if state.live_workers == 0 {
                // worker全灭 (panic等), 该槽位永远不会完成, 合成失败结果
                state.slots.remove(&next);
                state.next_out += 1;
                return Some(FrameOutput {
                    seq: next,
                    frame: None,
                    detections: Vec::new(),
                    error: Some("worker terminated before completing frame".to_string()),
                });
            }
            state = self.shared.cond.wait(state).unwrap();
        }
    }

    /// 释放推理池 (幂等, 部分失败后的清理路径也可安全调用)
    ///
    /// 停止接收新帧, 在途帧允许完成, 超时未退出的worker被放弃。
    pub fn release(&mut self, timeout: Duration) {
        if self.released {
            return;
        }
        self.released = true;
        self.token.cancel();
        self.tx.take(); // 关闭派发通道, worker清空积压后退出

        let state = self.shared.state.lock().unwrap();
        let (state, _) = self
            .shared
            .cond
            .wait_timeout_while(state, timeout, |s| s.live_workers > 0)
            .unwrap();
        let stragglers = state.live_workers;
        drop(state);

        if stragglers > 0 {
            eprintln!("⚠️  {}个推理线程超时未退出, 放弃等待", stragglers);
            self.handles.clear(); // 放弃join, 线程自行结束
        } else {
            for handle in self.handles.drain(..) {
                let _ = handle.join();
            }
        }
        self.shared.cond.notify_all();
    }
}

impl Drop for InferencePool {
    fn drop(&mut self) {
        self.release(Duration::from_secs(2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::Annotator;
    use crate::config::CLASSES;
    use crate::engine::StubEngine;
    use crate::postprocess::Yolov8Postprocessor;
    use crate::processor::{PipelineError, Yolov8Processor};
    use crate::proximity::ProximityEstimator;
    use rand::Rng;

    fn tiny_frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 2 * 2 * 3], 2, 2)
    }

    /// 抖动处理器: 随机睡眠模拟worker间耗时差异
    struct JitterProcessor;

    impl FrameProcessor for JitterProcessor {
        fn process(&mut self, _frame: &mut Frame) -> Result<Vec<ProximityResult>, PipelineError> {
            let ms = rand::thread_rng().gen_range(0..25);
            thread::sleep(Duration::from_millis(ms));
            Ok(Vec::new())
        }
    }

    /// 奇数序号必败的处理器
    struct OddFailProcessor;

    impl FrameProcessor for OddFailProcessor {
        fn process(&mut self, frame: &mut Frame) -> Result<Vec<ProximityResult>, PipelineError> {
            if frame.seq % 2 == 1 {
                return Err(PipelineError::BadFrame {
                    width: frame.width,
                    height: frame.height,
                    len: frame.data.len(),
                });
            }
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_fifo_order_under_jitter() {
        let mut pool = InferencePool::new(3, CancelToken::new(), |_| {
            Ok(Box::new(JitterProcessor) as Box<dyn FrameProcessor>)
        })
        .unwrap();

        for i in 0..20u8 {
            pool.submit(tiny_frame(i)).unwrap();
            // 隔几帧取一次, 制造提交/取回交错
            if i % 3 == 2 {
                let out = pool.retrieve().unwrap();
                assert_eq!(out.seq, (i / 3) as u64);
            }
        }
        let mut next = 20 / 3;
        while let Some(out) = pool.retrieve() {
            assert_eq!(out.seq, next);
            assert!(!out.is_failed());
            next += 1;
        }
        assert_eq!(next, 20);
        pool.release(Duration::from_secs(2));
    }

    #[test]
    fn test_per_frame_failure_does_not_stop_pipeline() {
        let mut pool = InferencePool::new(2, CancelToken::new(), |_| {
            Ok(Box::new(OddFailProcessor) as Box<dyn FrameProcessor>)
        })
        .unwrap();

        for i in 0..6u8 {
            pool.submit(tiny_frame(i)).unwrap();
        }
        for expect in 0..6u64 {
            let out = pool.retrieve().unwrap();
            assert_eq!(out.seq, expect);
            assert_eq!(out.is_failed(), expect % 2 == 1);
            assert!(out.frame.is_some()); // 失败帧也归还像素
        }
        assert!(pool.retrieve().is_none());
    }

    #[test]
    fn test_constructor_fails_fast() {
        let result = InferencePool::new(3, CancelToken::new(), |worker_id| {
            if worker_id == 1 {
                anyhow::bail!("no accelerator context available");
            }
            Ok(Box::new(JitterProcessor) as Box<dyn FrameProcessor>)
        });
        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("worker 1"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = InferencePool::new(2, CancelToken::new(), |_| {
            Ok(Box::new(JitterProcessor) as Box<dyn FrameProcessor>)
        })
        .unwrap();
        pool.submit(tiny_frame(0)).unwrap();
        let _ = pool.retrieve();
        pool.release(Duration::from_secs(2));
        pool.release(Duration::from_secs(2));
        assert!(pool.submit(tiny_frame(1)).is_err());
    }

    /// 端到端: 全背景张量 → 空检测列表 → 无报警 → 按序取回
    #[test]
    fn test_end_to_end_background_frames() {
        let (alert_tx, alert_rx) = crossbeam_channel::unbounded();
        let mut pool = InferencePool::new(3, CancelToken::new(), |_| {
            let processor = Yolov8Processor::new(
                Box::new(StubEngine::new(640, CLASSES.len())),
                Yolov8Postprocessor::default(),
                ProximityEstimator::default().with_alert_channel(alert_tx.clone()),
                Annotator::new(None),
            );
            Ok(Box::new(processor) as Box<dyn FrameProcessor>)
        })
        .unwrap();

        for _ in 0..4 {
            pool.submit(Frame::new(vec![0; 640 * 640 * 3], 640, 640))
                .unwrap();
        }
        for expect in 0..4u64 {
            let out = pool.retrieve().unwrap();
            assert_eq!(out.seq, expect);
            assert!(!out.is_failed());
            assert!(out.detections.is_empty());
        }
        assert!(alert_rx.try_recv().is_err()); // 无报警事件
    }
}
