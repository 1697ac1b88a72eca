/// 取消令牌与最新帧槽位
/// Cooperative cancellation and the single-slot latest-frame hand-off
use crate::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// 协作式取消令牌, 所有循环 (采集/推理派发/推流) 共用
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct SlotState {
    frame: Option<Frame>,
    generation: u64,
}

/// 最新帧槽位: 单写多读, 读侧在锁内取独占拷贝
///
/// 写线程只覆盖, 不排队; 慢消费者错过的帧直接被新帧替换。
/// 消费者绝不持锁处理, 拿到拷贝立即释放。
pub struct LatestSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl Default for LatestSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                frame: None,
                generation: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// 写入新帧并唤醒等待者
    pub fn publish(&self, frame: Frame) {
        let mut state = self.state.lock().unwrap();
        state.frame = Some(frame);
        state.generation += 1;
        drop(state);
        self.cond.notify_all();
    }

    /// 等待比`last_generation`更新的帧, 超时返回None
    ///
    /// 成功时更新`last_generation`, 同一帧不会被同一消费者取两次。
    pub fn wait_next(&self, last_generation: &mut u64, timeout: Duration) -> Option<Frame> {
        let state = self.state.lock().unwrap();
        let (state, timed_out) = self
            .cond
            .wait_timeout_while(state, timeout, |s| s.generation == *last_generation)
            .unwrap();
        if timed_out.timed_out() {
            return None;
        }
        *last_generation = state.generation;
        state.frame.clone()
    }

    /// 非阻塞取当前帧拷贝 (可能为空)
    pub fn try_copy(&self) -> Option<Frame> {
        self.state.lock().unwrap().frame.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn tiny_frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 12], 2, 2)
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_wait_next_sees_only_fresh_frames() {
        let slot = Arc::new(LatestSlot::new());
        let mut generation = 0;

        assert!(slot
            .wait_next(&mut generation, Duration::from_millis(10))
            .is_none());

        slot.publish(tiny_frame(1));
        let first = slot
            .wait_next(&mut generation, Duration::from_millis(100))
            .unwrap();
        assert_eq!(first.data[0], 1);

        // 同一代不会重复取到
        assert!(slot
            .wait_next(&mut generation, Duration::from_millis(10))
            .is_none());

        let writer = Arc::clone(&slot);
        let handle = thread::spawn(move || {
            writer.publish(tiny_frame(2));
        });
        let second = slot
            .wait_next(&mut generation, Duration::from_secs(1))
            .unwrap();
        assert_eq!(second.data[0], 2);
        handle.join().unwrap();
    }

    #[test]
    fn test_publish_overwrites() {
        let slot = LatestSlot::new();
        slot.publish(tiny_frame(1));
        slot.publish(tiny_frame(9));
        assert_eq!(slot.try_copy().unwrap().data[0], 9);
    }
}
