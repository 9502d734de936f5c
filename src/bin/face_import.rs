//! face_import - batch-import a directory of face photos into the search library
//!
//! Every jpg/jpeg/png/webp file in the directory becomes one search entry
//! labelled with its file stem. Items are processed strictly one after the
//! other; a bad photo is counted and skipped.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use faceflow_kernel::ingest::{collect_items, ImageCrateDecoder};
use faceflow_kernel::ui::Ui;
use faceflow_kernel::{FaceLibrary, IngestionPipeline, KernelConfig, StubExtractor};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory holding the photos to import.
    dir: PathBuf,
    /// Drop the existing search library before importing.
    #[arg(long)]
    clear: bool,
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

    if !args.dir.is_dir() {
        return Err(anyhow!("{} is not a directory", args.dir.display()));
    }
    let cfg = KernelConfig::load().context("load kernel config")?;
    let library = Arc::new(FaceLibrary::open(&cfg)?);
    if args.clear {
        let _stage = ui.stage("Clearing search library");
        library.clear_search()?;
    }

    let items = {
        let _stage = ui.stage("Scanning import directory");
        collect_items(&args.dir)
    };
    log::info!("importing {} photos from {}", items.len(), args.dir.display());

    let progress = ui.import_progress(items.len());
    let pipeline = IngestionPipeline::new(
        Arc::new(ImageCrateDecoder),
        Arc::new(StubExtractor::new()),
        library.clone(),
    )
    .with_observer(progress.observer());

    let (tally_tx, tally_rx) = mpsc::channel();
    let handle = pipeline.spawn(items, tally_tx);
    let tally = tally_rx
        .recv()
        .map_err(|_| anyhow!("import worker exited without a tally"))?;
    if handle.join().is_err() {
        log::warn!("import worker panicked after reporting");
    }
    progress.finish(&tally);

    println!(
        "{}",
        serde_json::json!({
            "success": tally.success_count,
            "failure": tally.failure_count,
            "library_size": library.search_len()?,
        })
    );
    Ok(())
}
