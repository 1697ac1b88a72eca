/// RTSP推流队列 (lossy)
/// Bounded, lossy hand-off between the inference loop and the encoder pipe
///
/// 实时推流宁可丢帧也不回压推理: 队列满时丢弃最旧一半, 保住最新画面。
/// 编码器管道断开后推流整体禁用, 流水线继续运行。
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::STREAM_QUEUE_CAP;
use crate::Frame;

/// 推流落点: 转发线程把帧原样写入注入的字节管道 (通常是ffmpeg stdin)
pub struct StreamingSink {
    tx: Option<Sender<Frame>>,
    rx_drain: Receiver<Frame>,
    enabled: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl StreamingSink {
    pub fn new(mut writer: Box<dyn Write + Send>) -> Self {
        let (tx, rx) = bounded::<Frame>(STREAM_QUEUE_CAP);
        let enabled = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        let thread_enabled = Arc::clone(&enabled);
        let thread_rx = rx.clone();
        let handle = thread::Builder::new()
            .name("stream-fwd".to_string())
            .spawn(move || loop {
                match thread_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(frame) => {
                        if !thread_enabled.load(Ordering::SeqCst) {
                            continue; // 管道已断, 只清空队列不再写
                        }
                        if let Err(e) = writer.write_all(&frame.data) {
                            eprintln!("❌ 推流管道写入失败: {}, 推流已禁用", e);
                            thread_enabled.store(false, Ordering::SeqCst);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .ok();

        if handle.is_none() {
            eprintln!("❌ 推流转发线程启动失败, 推流已禁用");
            enabled.store(false, Ordering::SeqCst);
        }

        Self {
            tx: Some(tx),
            rx_drain: rx,
            enabled,
            dropped,
            handle,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// 手动开/关推流 (管道断开后的enable只是恢复投递, 写入仍会再次失败)
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// 累计丢弃帧数
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// 投递一帧, 绝不阻塞; 返回是否成功入队
    ///
    /// 队列满时从最旧端排掉容量的一半再入队; 竞争下仍满则丢弃本帧。
    pub fn offer(&self, frame: Frame) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return false, // 已关闭
        };

        if tx.is_full() {
            let mut purged = 0u64;
            for _ in 0..STREAM_QUEUE_CAP / 2 {
                if self.rx_drain.try_recv().is_err() {
                    break;
                }
                purged += 1;
            }
            if purged > 0 {
                self.dropped.fetch_add(purged, Ordering::SeqCst);
                eprintln!("⚠️  推流积压, 丢弃最旧{}帧", purged);
            }
        }
        if tx.try_send(frame).is_err() {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// 关闭推流 (幂等): 停止接收, 给转发线程限时排空, 超时则放弃
    pub fn shutdown(&mut self, timeout: Duration) {
        self.tx.take(); // 断开发送端, 转发线程排空后自行退出
        let handle = match self.handle.take() {
            Some(h) => h,
            None => return,
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            eprintln!("⚠️  推流转发线程超时未退出, 放弃等待");
        }
    }
}

impl Drop for StreamingSink {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}

/// 推流缩放器: 标注后原始帧 → 推流分辨率RGB24
pub struct StreamScaler {
    width: u32,
    height: u32,
    resizer: fast_image_resize::Resizer,
}

impl StreamScaler {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            resizer: fast_image_resize::Resizer::new(),
        }
    }

    /// 缩放到推流尺寸, 序号和时间戳原样保留
    pub fn scale(&mut self, frame: &Frame) -> anyhow::Result<Frame> {
        use fast_image_resize::images::Image;
        use fast_image_resize::PixelType;

        let src = Image::from_vec_u8(
            frame.width,
            frame.height,
            frame.data.clone(),
            PixelType::U8x3,
        )?;
        let mut dst = Image::new(self.width, self.height, PixelType::U8x3);
        self.resizer.resize(&src, &mut dst, None)?;

        let mut out = Frame::new(dst.into_vec(), self.width, self.height);
        out.seq = frame.seq;
        out.captured_at = frame.captured_at;
        Ok(out)
    }
}

/// 启动ffmpeg推流进程, 返回其stdin作为推流管道
///
/// rawvideo/rgb24从stdin灌入, x264零延迟编码推RTSP。
pub fn spawn_ffmpeg_encoder(
    url: &str,
    width: u32,
    height: u32,
    fps: u32,
) -> anyhow::Result<(Box<dyn Write + Send>, Child)> {
    let mut child = Command::new("ffmpeg")
        .args([
            "-re",
            "-f",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            &format!("{}x{}", width, height),
            "-r",
            &fps.to_string(),
            "-i",
            "-",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-pix_fmt",
            "yuv420p",
            "-f",
            "rtsp",
            url,
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| anyhow::anyhow!("ffmpeg启动失败: {}", e))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("ffmpeg stdin不可用"))?;
    println!("🚀 推流已启动: {} ({}x{}@{}fps)", url, width, height, fps);
    Ok((Box::new(stdin), child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    fn tagged_frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 2 * 2 * 3], 2, 2)
    }

    /// 把所有写入的字节收集起来的测试管道
    #[derive(Clone)]
    struct CollectingWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for CollectingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// 第一次写入阻塞直到放行信号, 用于钉住转发线程制造积压
    struct GatedWriter {
        gate: Receiver<()>,
        first: bool,
        out: CollectingWriter,
    }

    impl Write for GatedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.first {
                self.first = false;
                let _ = self.gate.recv();
            }
            self.out.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipeWriter;

    impl Write for BrokenPipeWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_forwards_frames_in_order() {
        let out = CollectingWriter(Arc::new(Mutex::new(Vec::new())));
        let mut sink = StreamingSink::new(Box::new(out.clone()));
        for tag in 1..=3u8 {
            assert!(sink.offer(tagged_frame(tag)));
        }
        sink.shutdown(Duration::from_secs(2));

        let expected: Vec<u8> = (1..=3u8).flat_map(|t| vec![t; 12]).collect();
        assert_eq!(*out.0.lock().unwrap(), expected);
        assert_eq!(sink.dropped_frames(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest_half_keeps_newest() {
        let out = CollectingWriter(Arc::new(Mutex::new(Vec::new())));
        let (release, gate) = bounded::<()>(1);
        let mut sink = StreamingSink::new(Box::new(GatedWriter {
            gate,
            first: true,
            out: out.clone(),
        }));

        // 帧0被转发线程取走并卡在写入上
        sink.offer(tagged_frame(0));
        thread::sleep(Duration::from_millis(100));
        // 帧1..=8正好填满队列, 帧9触发丢弃最旧4帧
        for tag in 1..=9u8 {
            sink.offer(tagged_frame(tag));
        }
        assert_eq!(sink.dropped_frames(), 4);

        release.send(()).unwrap();
        sink.shutdown(Duration::from_secs(2));

        // 留下的是 0(在写) + 5..=9 (最新), 1..=4被排掉
        let expected: Vec<u8> = [0u8, 5, 6, 7, 8, 9]
            .iter()
            .flat_map(|t| vec![*t; 12])
            .collect();
        assert_eq!(*out.0.lock().unwrap(), expected);
    }

    #[test]
    fn test_broken_pipe_disables_sink() {
        let mut sink = StreamingSink::new(Box::new(BrokenPipeWriter));
        sink.offer(tagged_frame(1));

        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.is_enabled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!sink.is_enabled());

        // 禁用后offer是空操作, 不panic不阻塞
        for tag in 0..32u8 {
            assert!(!sink.offer(tagged_frame(tag)));
        }
        sink.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_manual_toggle_gates_offer() {
        let out = CollectingWriter(Arc::new(Mutex::new(Vec::new())));
        let mut sink = StreamingSink::new(Box::new(out.clone()));
        sink.set_enabled(false);
        assert!(!sink.offer(tagged_frame(1)));
        sink.set_enabled(true);
        assert!(sink.offer(tagged_frame(2)));
        sink.shutdown(Duration::from_secs(2));
        assert_eq!(*out.0.lock().unwrap(), vec![2u8; 12]);
    }

    #[test]
    fn test_scaler_downscales_to_push_size() {
        let mut scaler = StreamScaler::new(4, 2);
        let mut frame = Frame::new(vec![128; 8 * 4 * 3], 8, 4);
        frame.seq = 17;
        let scaled = scaler.scale(&frame).unwrap();
        assert_eq!((scaled.width, scaled.height), (4, 2));
        assert_eq!(scaled.data.len(), 4 * 2 * 3);
        assert_eq!(scaled.seq, 17);
        // 纯色图缩放后仍为纯色
        assert!(scaled.data.iter().all(|b| (*b as i32 - 128).abs() <= 1));
    }
}
