/// 会话生命周期: 一次警戒运行中全部长生命周期资源的属主
/// Owns token, latest-frame slot, pool, sink and acquisition; tears them
/// down in a fixed order so shutdown is safe from any point of failure
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;

use crate::pool::InferencePool;
use crate::processor::FrameProcessor;
use crate::source::{spawn_acquisition, Acquisition, FrameSource};
use crate::stream::StreamingSink;
use crate::sync::{CancelToken, LatestSlot};

/// 停机时给各线程的退场时限
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// 一次警戒会话
pub struct SentinelSession {
    pub token: CancelToken,
    pub slot: Arc<LatestSlot>,
    pub pool: InferencePool,
    pub acquisition: Acquisition,
    sink: Option<StreamingSink>,
    encoder: Option<Child>,
    shut_down: bool,
}

impl SentinelSession {
    /// 启动会话: 推理池先行 (构建失败时什么都还没跑), 采集随后
    ///
    /// 任一步失败时已建好的部分由Drop链自动回收。
    pub fn start<F>(
        source: Box<dyn FrameSource>,
        fps: f32,
        workers: usize,
        factory: F,
    ) -> anyhow::Result<Self>
    where
        F: FnMut(usize) -> anyhow::Result<Box<dyn FrameProcessor>>,
    {
        let token = CancelToken::new();
        let slot = Arc::new(LatestSlot::new());
        let pool = InferencePool::new(workers, token.clone(), factory)?;
        let acquisition = spawn_acquisition(source, Arc::clone(&slot), token.clone(), fps)
            .map_err(|e| anyhow::anyhow!("采集线程启动失败: {}", e))?;

        Ok(Self {
            token,
            slot,
            pool,
            acquisition,
            sink: None,
            encoder: None,
            shut_down: false,
        })
    }

    /// 挂载推流 (sink + 编码器子进程)
    pub fn attach_stream(&mut self, sink: StreamingSink, encoder: Child) {
        self.sink = Some(sink);
        self.encoder = Some(encoder);
    }

    pub fn sink(&self) -> Option<&StreamingSink> {
        self.sink.as_ref()
    }

    /// 有序停机 (幂等)
    ///
    /// 顺序固定: 取消令牌 → 采集 → 推理池 → 推流队列 → 编码器进程。
    /// 上游先停, 下游排空, 不会有线程往已关闭的环节投递。
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.token.cancel();
        self.acquisition.join();
        self.pool.release(SHUTDOWN_TIMEOUT);
        if let Some(mut sink) = self.sink.take() {
            sink.shutdown(SHUTDOWN_TIMEOUT);
        }
        if let Some(mut encoder) = self.encoder.take() {
            // stdin已随sink关闭, ffmpeg正常收尾; 不退出就强杀
            match encoder.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    std::thread::sleep(Duration::from_millis(500));
                    if let Ok(None) | Err(_) = encoder.try_wait() {
                        let _ = encoder.kill();
                    }
                    let _ = encoder.wait();
                }
            }
        }
        println!("✅ 会话已退出");
    }
}

impl Drop for SentinelSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
