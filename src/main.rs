//! dusk: session daemon and companion CLI for Wayland desktop shells.

#[macro_use]
extern crate tracing;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod buffer;
mod capture;
mod dbus;
mod encode;
mod jobs;
mod prompt;
mod protocols;
mod region;
mod selector;
mod utils;
mod wayland;

use capture::{CaptureResult, Mode, Screenshoter};
use encode::ImageFormat;

#[derive(Parser)]
#[command(name = "dusk", version, about = "Session daemon and CLI for Wayland desktop shells")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the session daemon (screensaver hub and NM secret agent).
    Daemon,
    /// Capture screenshots.
    Screenshot {
        #[command(subcommand)]
        mode: Option<ScreenshotMode>,
        #[command(flatten)]
        opts: ScreenshotOpts,
    },
    /// List outputs.
    Outputs,
}

#[derive(Subcommand, Clone)]
enum ScreenshotMode {
    /// Select a region interactively (default).
    Region,
    /// Capture the focused output.
    Full,
    /// Capture all outputs combined.
    All,
    /// Capture a specific output.
    Output { name: String },
    /// Capture the focused window (Hyprland/dwl).
    Window,
    /// Capture the last selected region.
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CursorArg {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Png,
    #[value(alias = "jpeg")]
    Jpg,
    Ppm,
}

#[derive(Args, Clone)]
struct ScreenshotOpts {
    /// Include the cursor in the capture.
    #[arg(long, value_enum, default_value_t = CursorArg::Off)]
    cursor: CursorArg,
    /// Output format.
    #[arg(short = 'f', long, value_enum, default_value_t = FormatArg::Png)]
    format: FormatArg,
    /// JPEG quality (1-100).
    #[arg(short = 'q', long, default_value_t = 90)]
    quality: u8,
    /// Output directory.
    #[arg(short = 'd', long)]
    dir: Option<PathBuf>,
    /// Output filename (auto-generated if empty).
    #[arg(long)]
    filename: Option<String>,
    /// Don't copy to the clipboard.
    #[arg(long)]
    no_clipboard: bool,
    /// Don't save to a file.
    #[arg(long)]
    no_file: bool,
    /// Don't show a notification.
    #[arg(long)]
    no_notify: bool,
    /// Write the image to stdout (for piping to swappy and friends).
    #[arg(long)]
    stdout: bool,
}

fn main() -> anyhow::Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| "dusk=info".to_owned());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Daemon => {
            let runtime = tokio::runtime::Runtime::new().context("error creating runtime")?;
            runtime.block_on(dbus::run_daemon())
        }
        Command::Screenshot { mode, opts } => run_screenshot(mode, opts),
        Command::Outputs => run_outputs(),
    }
}

fn run_screenshot(mode: Option<ScreenshotMode>, opts: ScreenshotOpts) -> anyhow::Result<()> {
    let mode = match mode.unwrap_or(ScreenshotMode::Region) {
        ScreenshotMode::Region => Mode::Region,
        ScreenshotMode::Full => Mode::FullScreen,
        ScreenshotMode::All => Mode::AllScreens,
        ScreenshotMode::Output { name } => Mode::Output(name),
        ScreenshotMode::Window => Mode::Window,
        ScreenshotMode::Last => Mode::LastRegion,
    };
    let format = match opts.format {
        FormatArg::Png => ImageFormat::Png,
        FormatArg::Jpg => ImageFormat::Jpeg,
        FormatArg::Ppm => ImageFormat::Ppm,
    };
    let quality = opts.quality.clamp(1, 100);

    let mut screenshoter = Screenshoter::new(opts.cursor == CursorArg::On)?;
    let Some(mut result) = screenshoter.run(&mode)? else {
        // Selection cancelled; not an error.
        return Ok(());
    };

    if result.y_inverted {
        result.buffer.flip_vertical();
        result.y_inverted = false;
    }

    write_result(&result, format, quality, &opts)
}

fn write_result(
    result: &CaptureResult,
    format: ImageFormat,
    quality: u8,
    opts: &ScreenshotOpts,
) -> anyhow::Result<()> {
    if opts.stdout {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        encode::encode(&result.buffer, format, quality, &mut lock)?;
        lock.flush()?;
        return Ok(());
    }

    let mut file_path = None;

    if !opts.no_file {
        let dir = opts
            .dir
            .clone()
            .unwrap_or_else(encode::default_output_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("error creating {}", dir.display()))?;

        let filename = opts
            .filename
            .clone()
            .unwrap_or_else(|| encode::generate_filename(format));
        let path = dir.join(filename);

        let file = File::create(&path)
            .with_context(|| format!("error creating {}", path.display()))?;
        encode::encode(&result.buffer, format, quality, BufWriter::new(file))?;

        println!("{}", path.display());
        file_path = Some(path);
    }

    if !opts.no_clipboard {
        let mut data = Vec::new();
        // The clipboard always gets PNG or JPEG; PPM is file-only.
        let clip_format = match format {
            ImageFormat::Jpeg => ImageFormat::Jpeg,
            _ => ImageFormat::Png,
        };
        encode::encode(&result.buffer, clip_format, quality, &mut data)?;
        encode::copy_to_clipboard(&data, clip_format.mime_type())?;
        if opts.no_file {
            println!("Copied to clipboard");
        }
    }

    if !opts.no_notify {
        if let Err(err) = encode::show_screenshot_notification(file_path.as_deref()) {
            warn!("error showing screenshot notification: {err:#}");
        }
    }

    Ok(())
}

fn run_outputs() -> anyhow::Result<()> {
    let outputs = capture::list_outputs()?;
    for o in outputs {
        let scale = if o.fractional_scale.fract() == 0.0 {
            format!("{}", o.fractional_scale as i64)
        } else {
            format!("{:.2}", o.fractional_scale)
        };
        println!(
            "{}: {}x{}+{}+{} scale={} transform={}",
            o.name,
            o.width,
            o.height,
            o.x,
            o.y,
            scale,
            utils::transform_name(o.transform),
        );
    }
    Ok(())
}
