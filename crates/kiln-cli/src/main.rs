use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use tracing_subscriber::EnvFilter;

use kiln_cli::{ocr, open_dispatcher, OcrConfig, OcrNetwork, OcrWeights};
use kiln_kernels::fake::reference;
use kiln_kernels::opencl::{self, OpenClBackend};
use kiln_kernels::{DeviceType, DispatchError, MatMulShape, OpenClConfig};

#[derive(Parser)]
#[command(
    name = "kiln",
    about = "OpenCL tensor dispatch: device info, digit recognition, benchmarks",
    version
)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by commands that open a device session.
#[derive(clap::Args)]
struct DeviceArgs {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Kernel source file (default: built-in kernels)
    #[arg(long)]
    kernels: Option<PathBuf>,
    /// Work-group size
    #[arg(long)]
    local_size: Option<usize>,
    /// Device type: gpu, cpu, accelerator, all
    #[arg(long)]
    device: Option<DeviceType>,
}

impl DeviceArgs {
    /// Config file values with flags applied on top.
    fn resolve(&self) -> anyhow::Result<OcrConfig> {
        let mut config = OcrConfig::load_or_default(self.config.as_deref())?;
        if let Some(path) = &self.kernels {
            config.kernel_source = Some(path.clone());
        }
        if let Some(n) = self.local_size {
            config.local_size = n;
        }
        if let Some(device) = self.device {
            config.device_type = device;
        }
        Ok(config)
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List OpenCL platforms and devices
    Info,
    /// Classify a 28x28 digit image
    Classify {
        /// 24-bit BMP image
        #[arg(long)]
        image: PathBuf,
        /// Directory holding conv1.txt, conv2.txt, linear1.txt, linear2.txt
        #[arg(long)]
        weights_dir: Option<PathBuf>,
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// Benchmark square dense multiplies through kernel_multiply
    Bench {
        /// Matrix sizes to benchmark (comma-separated)
        #[arg(long, default_value = "64,128,256")]
        sizes: String,
        /// Launches per size
        #[arg(long, default_value = "10")]
        iters: usize,
        #[command(flatten)]
        device: DeviceArgs,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Info => cmd_info(),
        Commands::Classify { image, weights_dir, device } => {
            let mut config = device.resolve()?;
            if let Some(dir) = weights_dir {
                config.weights_dir = dir;
            }
            cmd_classify(&config, &image)
        }
        Commands::Bench { sizes, iters, device } => cmd_bench(&device.resolve()?, &sizes, iters),
    }
}

fn cmd_info() -> anyhow::Result<()> {
    println!("kiln v{}\n", env!("CARGO_PKG_VERSION"));

    let platforms = match opencl::probe() {
        Ok(p) => p,
        Err(e @ DispatchError::LibraryUnavailable(_)) => {
            println!("OpenCL: not available ({})", e);
            return Ok(());
        }
        Err(e) => return Err(e).context("probing OpenCL platforms"),
    };
    if platforms.is_empty() {
        println!("OpenCL: no platforms found");
        return Ok(());
    }

    for (i, platform) in platforms.iter().enumerate() {
        println!("Platform {}: {} ({})", i, platform.name, platform.version);
        if platform.devices.is_empty() {
            println!("  (no devices)");
        }
        for device in &platform.devices {
            println!(
                "  {:<40} max work-group {:>5}  global mem {:>6} MiB",
                device.name,
                device.max_work_group_size,
                device.global_mem_bytes / (1024 * 1024)
            );
        }
    }
    Ok(())
}

fn cmd_classify(config: &OcrConfig, image_path: &std::path::Path) -> anyhow::Result<()> {
    let weights = OcrWeights::load(&config.weight_paths()).context("loading weights")?;
    let image = kiln_io::bmp::read_bmp(image_path)?;

    let backend_config = OpenClConfig { device_type: config.device_type };
    let dispatcher = open_dispatcher::<OpenClBackend>(config, &backend_config)?;
    let mut network = OcrNetwork::new(dispatcher, weights);

    let prediction = network.classify(&image)?;
    let stats = network.dispatcher().stats();
    network.close()?;

    println!("Scores");
    for (digit, score) in prediction.scores.iter().enumerate() {
        let marker = if digit == prediction.digit { "  <" } else { "" };
        println!("  {}: {:>10.4}{}", digit, score, marker);
    }
    println!("Prediction: {}", prediction.digit);
    println!(
        "{} launches, {:.3}ms device time",
        stats.launches,
        stats.device_time.as_secs_f64() * 1000.0
    );
    Ok(())
}

fn cmd_bench(config: &OcrConfig, sizes_str: &str, iters: usize) -> anyhow::Result<()> {
    let sizes: Vec<usize> = sizes_str
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .filter(|&n| n > 0)
        .collect();
    let iters = iters.max(1);

    let backend_config = OpenClConfig { device_type: config.device_type };
    let mut d = open_dispatcher::<OpenClBackend>(config, &backend_config)?;

    println!("=== Kiln Dense Multiply Benchmark ===");
    println!("Device: {}  local size: {}\n", d.session().device_name(), d.session().local_size());
    println!("{:<12} {:>12} {:>10} {:>12}", "Size", "Mean (ms)", "GF/s", "Max err");
    println!("{}", "-".repeat(50));

    let mut rng = rand::thread_rng();
    for &n in &sizes {
        let a: Vec<f32> = (0..n * n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let b: Vec<f32> = (0..n * n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut out = vec![0.0f32; n * n];
        let shape = MatMulShape { left_rows: n, left_cols: n, right_rows: n, right_cols: n };

        // Warmup, also compiles the kernel
        d.dense_multiply(ocr::MULTIPLY, shape, &a, &b, &mut out)?;

        let mut total = Duration::ZERO;
        for _ in 0..iters {
            total += d.dense_multiply(ocr::MULTIPLY, shape, &a, &b, &mut out)?.elapsed;
        }
        let mean = total.as_secs_f64() / iters as f64;

        let expected = reference::multiply(&a, n, n, &b, n);
        let max_err = out
            .iter()
            .zip(&expected)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max);

        println!(
            "{:<12} {:>10.3}ms {:>10.2} {:>12.2e}",
            format!("{}x{}", n, n),
            mean * 1000.0,
            2.0 * (n as f64).powi(3) / mean / 1e9,
            max_err
        );
    }

    d.close()?;
    Ok(())
}
