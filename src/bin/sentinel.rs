/// 电子警戒主程序
/// Acquire → ordered NPU pool → decode → distance → annotate → (optional) RTSP push
use std::time::{Duration, Instant};

use clap::Parser;
use mimalloc::MiMalloc;

use proximity_sentinel::annotate::Annotator;
use proximity_sentinel::config::{Args, CLASSES, IMG_SIZE};
use proximity_sentinel::engine::StubEngine;
use proximity_sentinel::processor::{FrameProcessor, Yolov8Processor};
use proximity_sentinel::proximity::{AlertEvent, ProximityEstimator};
use proximity_sentinel::session::SentinelSession;
use proximity_sentinel::source::{DirectorySource, FrameSource, SyntheticSource};
use proximity_sentinel::stream::{spawn_ffmpeg_encoder, StreamScaler, StreamingSink};
use proximity_sentinel::{InferenceEngine, Yolov8Postprocessor};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    println!(
        "🚀 电子警戒启动 | workers={} conf={} iou={} fps={}",
        args.workers, args.conf, args.iou, args.fps
    );

    // 报警事件旁路: 独立线程打印JSON, 绝不阻塞推理
    let (alert_tx, alert_rx) = crossbeam_channel::unbounded::<AlertEvent>();
    let alert_printer = std::thread::Builder::new()
        .name("alert-print".to_string())
        .spawn(move || {
            for event in alert_rx.iter() {
                match serde_json::to_string(&event) {
                    Ok(json) => println!("🚨 {}", json),
                    Err(e) => eprintln!("⚠️  报警事件序列化失败: {}", e),
                }
            }
        })?;

    let source: Box<dyn FrameSource> = match &args.source {
        Some(dir) => Box::new(DirectorySource::open(dir)?),
        None => Box::new(SyntheticSource::new(1280, 720)),
    };

    let font = args.font.clone();
    let (conf, iou) = (args.conf, args.iou);
    let factory = move |worker_id: usize| -> anyhow::Result<Box<dyn FrameProcessor>> {
        let mut engine = StubEngine::new(IMG_SIZE, CLASSES.len());
        engine
            .warm_up()
            .map_err(|e| anyhow::anyhow!("worker {} 引擎预热失败: {}", worker_id, e))?;
        println!("✅ worker {} 引擎就绪 ({})", worker_id, engine.name());
        Ok(Box::new(Yolov8Processor::new(
            Box::new(engine),
            Yolov8Postprocessor::new(conf, iou),
            ProximityEstimator::default().with_alert_channel(alert_tx.clone()),
            Annotator::from_font_path(font.as_deref()),
        )) as Box<dyn FrameProcessor>)
    };

    let mut session = SentinelSession::start(source, args.fps, args.workers, factory)?;

    let mut scaler = None;
    if args.stream {
        match spawn_ffmpeg_encoder(
            &args.stream_url,
            args.push_width,
            args.push_height,
            args.push_fps,
        ) {
            Ok((pipe, encoder)) => {
                session.attach_stream(StreamingSink::new(pipe), encoder);
                scaler = Some(StreamScaler::new(args.push_width, args.push_height));
            }
            Err(e) => eprintln!("⚠️  推流启动失败: {}, 本次运行不推流", e),
        }
    }

    run_loop(&mut session, &args, scaler)?;

    session.shutdown();
    let _ = alert_printer.join(); // 池释放后报警发送端全部关闭, 打印线程自然退出
    Ok(())
}

/// 主循环: 预灌满流水线, 之后取一帧补一帧
fn run_loop(
    session: &mut SentinelSession,
    args: &Args,
    mut scaler: Option<StreamScaler>,
) -> anyhow::Result<()> {
    let mut generation = 0u64;
    let prefill = (session.pool.workers() + 1) as u64;
    let mut submitted = 0u64;
    while submitted < prefill {
        match pull_frame(session, &mut generation) {
            Some(frame) => {
                session.pool.submit(frame)?;
                submitted += 1;
            }
            None => break,
        }
    }

    let mut processed = 0u64;
    let mut alert_frames = 0u64;
    let mut window_start = Instant::now();
    loop {
        if args.frames > 0 && processed >= args.frames {
            break;
        }
        let out = match session.pool.retrieve() {
            Some(out) => out,
            None => break, // 在途帧耗尽
        };
        processed += 1;

        if let Some(err) = &out.error {
            eprintln!("⚠️  帧{}失败: {}", out.seq, err);
        } else {
            if out.detections.iter().any(|d| d.alert) {
                alert_frames += 1;
            }
            if let (Some(sink), Some(scaler), Some(frame)) =
                (session.sink(), scaler.as_mut(), out.frame.as_ref())
            {
                match scaler.scale(frame) {
                    Ok(scaled) => {
                        sink.offer(scaled);
                    }
                    Err(e) => eprintln!("⚠️  推流缩放失败: {}", e),
                }
            }
        }

        if processed % 30 == 0 {
            let fps = 30.0 / window_start.elapsed().as_secs_f32();
            println!(
                "📈 已处理{}帧 | {:.1}fps | 在途{} | 警戒帧{}",
                processed,
                fps,
                session.pool.in_flight(),
                alert_frames
            );
            window_start = Instant::now();
        }

        if let Some(frame) = pull_frame(session, &mut generation) {
            session.pool.submit(frame)?;
        }
    }

    let stream_dropped = session.sink().map(|s| s.dropped_frames()).unwrap_or(0);
    println!(
        "🏁 运行结束 | 共{}帧 | 警戒帧{} | 推流丢弃{}",
        processed, alert_frames, stream_dropped
    );
    Ok(())
}

/// 从最新帧槽位取下一帧; 帧源耗尽或会话取消时返回None
fn pull_frame(session: &SentinelSession, generation: &mut u64) -> Option<proximity_sentinel::Frame> {
    loop {
        match session
            .slot
            .wait_next(generation, Duration::from_millis(500))
        {
            Some(frame) => return Some(frame),
            None if session.acquisition.ended() => return None,
            None if session.token.is_cancelled() => return None,
            None => continue,
        }
    }
}
