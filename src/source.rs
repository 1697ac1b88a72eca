/// 帧源与采集线程
/// Frame sources and the acquisition thread that feeds the latest-frame slot
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::sync::{CancelToken, LatestSlot};
use crate::Frame;

/// 帧源单次读取的结果
pub enum SourceFrame {
    Frame(Frame),
    /// 暂时无帧 (解码失败/设备未就绪), 稍后重试
    NotReady,
    /// 帧源耗尽
    End,
}

/// 帧源接口: 采集线程对具体来源无感知
pub trait FrameSource: Send {
    fn describe(&self) -> String;

    fn next_frame(&mut self) -> SourceFrame;
}

/// 图片序列目录帧源 (按文件名排序)
pub struct DirectorySource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    index: usize,
}

impl DirectorySource {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| anyhow::anyhow!("帧源目录打开失败 {}: {}", dir.display(), e))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("jpg") | Some("jpeg") | Some("png") | Some("bmp")
                )
            })
            .collect();
        files.sort();
        anyhow::ensure!(!files.is_empty(), "目录中没有图片: {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            index: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectorySource {
    fn describe(&self) -> String {
        format!("图片目录 {} ({}张)", self.dir.display(), self.files.len())
    }

    fn next_frame(&mut self) -> SourceFrame {
        let path = match self.files.get(self.index) {
            Some(p) => p.clone(),
            None => return SourceFrame::End,
        };
        self.index += 1;
        match image::open(&path) {
            Ok(img) => {
                let rgb = img.to_rgb8();
                let (w, h) = rgb.dimensions();
                SourceFrame::Frame(Frame::new(rgb.into_raw(), w, h))
            }
            Err(e) => {
                eprintln!("⚠️  图片解码失败 {}: {}, 跳过", path.display(), e);
                SourceFrame::NotReady
            }
        }
    }
}

/// 合成帧源: 滚动渐变画面, 无真实相机时用于联调
pub struct SyntheticSource {
    width: u32,
    height: u32,
    tick: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tick: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("合成画面 {}x{}", self.width, self.height)
    }

    fn next_frame(&mut self) -> SourceFrame {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = vec![0u8; w * h * 3];
        let shift = (self.tick * 3) as usize;
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 3;
                data[i] = ((x + shift) % 256) as u8;
                data[i + 1] = (y % 256) as u8;
                data[i + 2] = 64;
            }
        }
        self.tick += 1;
        SourceFrame::Frame(Frame::new(data, self.width, self.height))
    }
}

/// 采集线程句柄
pub struct Acquisition {
    handle: Option<JoinHandle<()>>,
    ended: Arc<AtomicBool>,
}

impl Acquisition {
    /// 帧源是否已耗尽 (或采集线程已退出)
    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// 启动采集线程: 按目标帧率从帧源读帧, 覆盖写入最新帧槽位
///
/// 消费侧跟不上时中间帧被覆盖丢弃, 采集节奏不受影响。
pub fn spawn_acquisition(
    mut source: Box<dyn FrameSource>,
    slot: Arc<LatestSlot>,
    token: CancelToken,
    fps: f32,
) -> std::io::Result<Acquisition> {
    let ended = Arc::new(AtomicBool::new(false));
    let thread_ended = Arc::clone(&ended);
    let interval = Duration::from_secs_f32(1.0 / fps.max(0.1));

    println!("📷 采集启动: {}", source.describe());
    let handle = thread::Builder::new()
        .name("acquire".to_string())
        .spawn(move || {
            while !token.is_cancelled() {
                let started = Instant::now();
                match source.next_frame() {
                    SourceFrame::Frame(frame) => slot.publish(frame),
                    SourceFrame::NotReady => {
                        thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    SourceFrame::End => {
                        println!("⏹  帧源耗尽, 采集结束");
                        break;
                    }
                }
                let elapsed = started.elapsed();
                if elapsed < interval {
                    thread::sleep(interval - elapsed);
                }
            }
            thread_ended.store(true, Ordering::SeqCst);
        })?;

    Ok(Acquisition {
        handle: Some(handle),
        ended,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_source_animates() {
        let mut source = SyntheticSource::new(8, 4);
        let first = match source.next_frame() {
            SourceFrame::Frame(f) => f,
            _ => panic!("synthetic source must always produce"),
        };
        let second = match source.next_frame() {
            SourceFrame::Frame(f) => f,
            _ => panic!("synthetic source must always produce"),
        };
        assert_eq!((first.width, first.height), (8, 4));
        assert_eq!(first.data.len(), 8 * 4 * 3);
        assert_ne!(first.data, second.data); // 画面滚动
    }

    #[test]
    fn test_directory_source_reads_sorted_then_ends() {
        let dir = std::env::temp_dir().join(format!("sentinel-src-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["b.png", "a.png"] {
            image::RgbImage::new(4, 4).save(dir.join(name)).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let mut source = DirectorySource::open(&dir).unwrap();
        assert_eq!(source.len(), 2);
        for _ in 0..2 {
            assert!(matches!(source.next_frame(), SourceFrame::Frame(_)));
        }
        assert!(matches!(source.next_frame(), SourceFrame::End));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_directory_source_empty_dir_is_error() {
        let dir = std::env::temp_dir().join(format!("sentinel-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(DirectorySource::open(&dir).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_acquisition_publishes_and_stops_on_cancel() {
        let slot = Arc::new(LatestSlot::new());
        let token = CancelToken::new();
        let mut acq = spawn_acquisition(
            Box::new(SyntheticSource::new(4, 4)),
            Arc::clone(&slot),
            token.clone(),
            100.0,
        )
        .unwrap();

        let mut generation = 0;
        let frame = slot.wait_next(&mut generation, Duration::from_secs(2));
        assert!(frame.is_some());

        token.cancel();
        acq.join();
        assert!(acq.ended());
    }
}
