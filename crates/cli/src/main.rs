use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};

use qdense_common::{EinsumDenseConfig, OutputShape, QuantizationMode};
use qdense_core::{analyze_shapes, AxisPlan, EinsumDense, ParsedEquation, TensorStore};

#[derive(Parser, Debug)]
#[command(name = "qdense", about = "Einsum-dense layers with dynamic int8 quantization")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve shapes and the int8 axis plan of an equation, printed as JSON.
    Analyze(AnalyzeArgs),
    /// Quantize a saved float layer to int8.
    Quantize(QuantizeArgs),
    /// Compare a random float layer against its int8 quantization.
    Check(CheckArgs),
}

// ── Analyze ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct AnalyzeArgs {
    #[arg(long)]
    equation: String,
    /// Comma-separated, batch first; `?` for an unknown dimension.
    #[arg(long)]
    input_shape: String,
    /// Output shape without batch and elided axes; `?` takes it from the input.
    #[arg(long, default_value = "")]
    output_shape: String,
    #[arg(long)]
    bias_axes: Option<String>,
}

// ── Quantize ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct QuantizeArgs {
    /// Layer config (JSON).
    #[arg(long)]
    config: PathBuf,
    /// Float weights (safetensors, keys "0"/"1").
    #[arg(long)]
    weights: PathBuf,
    /// Input shape the layer is built for, batch first.
    #[arg(long)]
    input_shape: String,
    /// Int8 weights (safetensors). The updated config is written next to it
    /// with a `.json` extension.
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value = "int8")]
    mode: String,
}

// ── Check ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct CheckArgs {
    #[arg(long, default_value = "ab,bc->ac")]
    equation: String,
    #[arg(long, default_value = "8,32")]
    input_shape: String,
    #[arg(long, default_value = "64")]
    output_shape: String,
    #[arg(long)]
    bias_axes: Option<String>,
    #[arg(long)]
    lora_rank: Option<usize>,
    /// Forward passes per timing run.
    #[arg(long, default_value_t = 20)]
    iterations: usize,
    /// Where to write the int8 round-trip file; defaults to the temp dir.
    #[arg(long)]
    store: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => cmd_analyze(args),
        Command::Quantize(args) => cmd_quantize(args),
        Command::Check(args) => cmd_check(args),
    }
}

// ── Shape parsing ──────────────────────────────────────────────────────────────

fn parse_dims(s: &str) -> Result<Vec<Option<usize>>> {
    s.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| match d {
            "?" | "none" | "null" => Ok(None),
            _ => d
                .parse::<usize>()
                .map(Some)
                .with_context(|| format!("bad dimension '{d}' in '{s}'")),
        })
        .collect()
}

fn concrete_dims(s: &str) -> Result<Vec<usize>> {
    parse_dims(s)?
        .into_iter()
        .map(|d| d.with_context(|| format!("shape '{s}' must be fully specified")))
        .collect()
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_analyze(args: AnalyzeArgs) -> Result<()> {
    let equation = ParsedEquation::parse(&args.equation)?;
    let input_shape = parse_dims(&args.input_shape)?;
    let output_shape = parse_dims(&args.output_shape)?;
    let shapes = analyze_shapes(
        &equation,
        args.bias_axes.as_deref(),
        &input_shape,
        &output_shape,
    )?;
    let plan = AxisPlan::from_parsed(&equation, input_shape.len())?;
    let input_scale_shape = input_shape
        .iter()
        .copied()
        .collect::<Option<Vec<usize>>>()
        .map(|dims| plan.input.scale_shape(&dims));

    let report = serde_json::json!({
        "equation": args.equation,
        "ellipsis": format!("{:?}", equation.ellipsis),
        "kernel_shape": shapes.kernel_shape,
        "bias_shape": shapes.bias_shape,
        "output_shape": shapes.output_shape,
        "input_scale_shape": input_scale_shape,
        "kernel_scale_shape": plan.weight.scale_shape(&shapes.kernel_shape),
        "axis_plan": plan,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_quantize(args: QuantizeArgs) -> Result<()> {
    let device = Device::Cpu;
    let mode: QuantizationMode = args.mode.parse()?;
    let config = EinsumDenseConfig::load(&args.config)?;
    if config.dtype.quantization_mode().is_some() {
        bail!(
            "{} already describes a quantized layer ({})",
            args.config.display(),
            config.dtype
        );
    }
    let input_shape = concrete_dims(&args.input_shape)?;

    let mut layer = EinsumDense::new(config, &input_shape, &device)?;
    layer.load_own_variables(&TensorStore::load(&args.weights, &device)?)?;
    layer.quantize(mode)?;

    let mut store = TensorStore::new();
    layer.save_own_variables(&mut store)?;
    store.save(&args.output)?;
    let config_path = args.output.with_extension("json");
    layer.config().save(&config_path)?;

    let float_bytes = std::fs::metadata(&args.weights)?.len();
    let int8_bytes = std::fs::metadata(&args.output)?.len();
    eprintln!(
        "Quantized {} kernel {:?}: {} tensors, {} -> {} bytes on disk",
        layer.config().equation,
        layer.kernel_shape(),
        store.len(),
        float_bytes,
        int8_bytes
    );
    eprintln!("Weights: {}", args.output.display());
    eprintln!("Config:  {}", config_path.display());
    Ok(())
}

fn cmd_check(args: CheckArgs) -> Result<()> {
    let device = Device::Cpu;
    let input_shape = concrete_dims(&args.input_shape)?;
    let mut config = EinsumDenseConfig::new(
        args.equation.clone(),
        OutputShape::Dims(parse_dims(&args.output_shape)?),
    );
    config.bias_axes = args.bias_axes.clone();
    config.lora_rank = args.lora_rank;

    let mut layer = EinsumDense::new(config, &input_shape, &device)?;
    let x = Tensor::randn(0f32, 1., input_shape.as_slice(), &device)?;

    let (float_y, float_ms) = timed(&layer, &x, args.iterations)?;
    layer.quantize(QuantizationMode::Int8)?;
    layer.cache_quantized()?;
    let (int8_y, int8_ms) = timed(&layer, &x, args.iterations)?;
    layer.clear_cache();
    let rel_err = relative_error(&int8_y, &float_y)?;

    println!("equation        {}", args.equation);
    println!("output shape    {:?}", int8_y.dims());
    println!("float forward   {float_ms:.3} ms");
    println!("int8 forward    {int8_ms:.3} ms");
    println!("relative error  {rel_err:.3e}");

    let path = args.store.clone().unwrap_or_else(|| {
        std::env::temp_dir().join(format!("qdense-check-{}.safetensors", std::process::id()))
    });
    let mut store = TensorStore::new();
    layer.save_own_variables(&mut store)?;
    store.save(&path)?;

    let mut reloaded = EinsumDense::new(layer.config().clone(), &input_shape, &device)?;
    reloaded.load_own_variables(&TensorStore::load(&path, &device)?)?;
    if args.store.is_none() {
        std::fs::remove_file(&path)
            .with_context(|| format!("removing {}", path.display()))?;
    }
    let reloaded_y = reloaded.forward(&x)?;
    let drift = relative_error(&reloaded_y, &int8_y)?;
    println!("reload drift    {drift:.3e}");

    // A merged adapter is requantized on save, so only adapter-free layers
    // must reload exactly.
    if args.lora_rank.is_none() {
        ensure!(drift < 1e-6, "reloaded int8 layer drifted by {drift:.3e}");
    }
    Ok(())
}

/// Mean forward latency in milliseconds, plus the last output.
fn timed(layer: &EinsumDense, x: &Tensor, iterations: usize) -> Result<(Tensor, f64)> {
    let mut y = layer.forward(x)?;
    let start = Instant::now();
    for _ in 0..iterations {
        y = layer.forward(x)?;
    }
    let ms = start.elapsed().as_secs_f64() * 1e3 / iterations.max(1) as f64;
    Ok((y, ms))
}

fn relative_error(a: &Tensor, b: &Tensor) -> Result<f64> {
    let num = (a - b)?.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
    let den = b.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
    Ok((num / den.max(1e-12)).sqrt())
}
