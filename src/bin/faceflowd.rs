//! faceflowd - run one face flow against the configured camera
//!
//! Binds a camera, starts a verification, search, enrollment or liveness
//! flow with the registered engine, answers dialogs from the command line
//! and prints the terminal result as JSON on stdout.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use faceflow_kernel::source::platform_for;
use faceflow_kernel::ui::Ui;
use faceflow_kernel::{
    CameraPlatform, CameraSlot, DialogChoice, EngineRegistry, EnrollTarget, FaceLibrary,
    FlowController, FlowEvent, FlowKind, FlowResult, FlowServices, FlowSetup, KernelConfig,
    StubEngine, StubExtractor, SyntheticPlatform, UiIntent,
};

const PUMP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FlowArg {
    Verify,
    Search,
    Enroll,
    Liveness,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetArg {
    Verify,
    Search,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DialogArg {
    Retry,
    Dismiss,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Flow to run.
    #[arg(long, value_enum)]
    flow: FlowArg,
    /// Face label to verify against or enroll as.
    #[arg(long)]
    label: Option<String>,
    /// Library an enrolled face is added to.
    #[arg(long, value_enum, default_value = "verify")]
    target: TargetArg,
    /// Search tag stored with a search enrollment.
    #[arg(long, default_value = "")]
    tag: String,
    /// Search group stored with a search enrollment.
    #[arg(long, default_value = "")]
    group: String,
    /// Accept the first captured face during enrollment.
    #[arg(long)]
    auto_confirm: bool,
    /// Answer to retry dialogs.
    #[arg(long, value_enum, default_value = "retry")]
    on_dialog: DialogArg,
    /// Cancel the flow after this many seconds.
    #[arg(long, default_value_t = 30)]
    max_seconds: u64,
    /// Comma-separated brightness levels for a synthetic camera (e.g. "10,128").
    #[arg(long, value_delimiter = ',')]
    levels: Vec<u8>,
    /// UI mode: auto, plain, pretty.
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let cfg = KernelConfig::load().context("load kernel config")?;

    let platform: Box<dyn CameraPlatform> = if args.levels.is_empty() {
        platform_for(&cfg.camera)
    } else {
        Box::new(
            SyntheticPlatform::single(cfg.camera.facing)
                .with_levels(args.levels.clone())
                .with_pacing(cfg.camera.target_fps),
        )
    };

    let mut registry = EngineRegistry::new();
    registry.register(StubEngine::new);
    registry.set_default(&cfg.engine)?;

    let library = {
        let _stage = ui.stage("Opening face library");
        Arc::new(FaceLibrary::open(&cfg)?)
    };
    let extractor = Arc::new(StubExtractor::new());
    let services = FlowServices {
        library,
        extractor: extractor.clone(),
        comparator: extractor,
    };

    let kind = flow_kind(args.flow);
    let slot = CameraSlot::new();
    let bound = {
        let _stage = ui.stage("Binding camera");
        slot.bind(platform.as_ref(), cfg.camera.facing, &cfg.camera)
    };
    let session = match bound {
        Ok(session) => session,
        Err(err) => {
            log::error!("{}", err);
            let mut result = FlowResult::new(kind, err.result_code());
            result.message = err.to_string();
            println!("{}", serde_json::to_string(&result)?);
            std::process::exit(1);
        }
    };
    if let Some(device) = session.device() {
        log::info!("using {} camera {}", device.facing, device.id);
    }

    let (events_tx, events_rx) = mpsc::channel();
    let setup = FlowSetup {
        session,
        engine: registry.engine_for(kind)?,
        services,
        events: events_tx,
    };
    let mut controller = match args.flow {
        FlowArg::Verify => {
            let label = args
                .label
                .as_deref()
                .ok_or_else(|| anyhow!("--label is required for verification"))?;
            FlowController::verification(setup, label, &cfg.verify)?
        }
        FlowArg::Search => FlowController::search(setup, &cfg.search)?,
        FlowArg::Enroll => {
            let target = match args.target {
                TargetArg::Verify => EnrollTarget::Verify,
                TargetArg::Search => EnrollTarget::Search {
                    tag: args.tag.clone(),
                    group: args.group.clone(),
                },
            };
            FlowController::enrollment(setup, target, args.label.clone(), &cfg.enroll)?
        }
        FlowArg::Liveness => FlowController::liveness(setup, &cfg.verify)?,
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("install Ctrl-C handler")?;

    let deadline = Instant::now() + Duration::from_secs(args.max_seconds);
    let result = loop {
        let finished = controller.pump(PUMP_INTERVAL);
        while let Ok(event) = events_rx.try_recv() {
            ui.flow_event(&event);
            match event {
                FlowEvent::ConfirmFace { .. } if args.auto_confirm => {
                    controller.confirm_enrollment(args.label.as_deref());
                }
                FlowEvent::ConfirmFace { .. } => {
                    log::warn!("face awaiting confirmation; pass --auto-confirm to accept");
                    controller.reject_enrollment();
                }
                FlowEvent::Intent {
                    ticket,
                    intent: UiIntent::Dialog { .. },
                } => {
                    let choice = match args.on_dialog {
                        DialogArg::Retry => DialogChoice::Retry,
                        DialogArg::Dismiss => DialogChoice::Dismiss,
                    };
                    controller.acknowledge_dialog(ticket, choice);
                }
                _ => {}
            }
        }
        if let Some(result) = finished.or_else(|| controller.result().cloned()) {
            break result;
        }
        if interrupted.load(Ordering::SeqCst) {
            log::info!("interrupted, cancelling flow");
            controller.cancel();
        } else if Instant::now() >= deadline {
            log::warn!("no result after {}s, cancelling flow", args.max_seconds);
            controller.cancel();
        }
    };
    slot.release();

    println!("{}", serde_json::to_string(&result)?);
    if result.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn flow_kind(flow: FlowArg) -> FlowKind {
    match flow {
        FlowArg::Verify => FlowKind::Verification,
        FlowArg::Search => FlowKind::Search,
        FlowArg::Enroll => FlowKind::Enrollment,
        FlowArg::Liveness => FlowKind::Liveness,
    }
}
