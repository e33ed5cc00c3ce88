use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use precode::{
    EngineConfig, EntryPointPlan, IsaMode, MethodFlags, PrecodeCapabilities, PrecodeKind,
    TemporaryEntryPointAllocator,
};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum IsaArg {
    Host,
    #[value(name = "x86-64")]
    X86_64,
    Aarch64,
}

impl From<IsaArg> for IsaMode {
    fn from(arg: IsaArg) -> Self {
        match arg {
            IsaArg::Host => IsaMode::Host,
            IsaArg::X86_64 => IsaMode::X86_64,
            IsaArg::Aarch64 => IsaMode::Aarch64,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum FormatArg {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "precode")]
#[command(about = "Inspect precode layouts and precompiled precode images", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Instruction set to lay precodes out for (overrides the config)
    #[arg(long, global = true, value_enum)]
    isa: Option<IsaArg>,

    /// Log every allocation and retarget
    #[arg(long, global = true)]
    trace: bool,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "human")]
    format: FormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the precode layout table of an ISA
    Layout,
    /// Show how temporary entry points would be laid out for a chunk
    Plan {
        /// Number of methods in the chunk
        #[arg(long)]
        count: usize,

        /// Methods are dynamic (lightweight generated code)
        #[arg(long)]
        dynamic: bool,

        /// Methods require a stable entry point
        #[arg(long)]
        stable: bool,

        /// Methods expect their descriptor in a scratch register
        #[arg(long)]
        special_cc: bool,
    },
    /// Build or dump precompiled precode images
    #[cfg(feature = "image")]
    Image {
        #[command(subcommand)]
        action: ImageCommand,
    },
}

#[cfg(feature = "image")]
#[derive(Subcommand)]
enum ImageCommand {
    /// Save the temporary entry points of a synthetic chunk
    Build {
        /// Number of methods in the chunk
        #[arg(long)]
        methods: u32,

        /// Mark the first N methods as read during profiling
        #[arg(long, default_value = "0")]
        hot: u32,

        /// Output file
        #[arg(long, short)]
        out: PathBuf,
    },
    /// Summarize an image file
    Dump {
        /// Image file
        file: PathBuf,
    },
}

#[derive(Serialize)]
struct LayoutRow {
    kind: PrecodeKind,
    size: Option<usize>,
    alignment: usize,
}

/// Placeholder runtime entry points. The CLI lays stubs out but never runs
/// them, so each trampoline only needs a distinct address.
#[cfg(feature = "image")]
static TRAMPOLINE_AREA: [u8; 64] = [0xCC; 64];

#[cfg(feature = "image")]
fn trampolines() -> precode::Trampolines {
    let base = TRAMPOLINE_AREA.as_ptr() as usize;
    precode::Trampolines {
        prestub: base,
        fixup_thunk: base + 16,
        ndirect_import_thunk: base + 32,
        remoting_check_thunk: base + 48,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => EngineConfig::default(),
    };
    if let Some(isa) = cli.isa {
        config.isa = isa.into();
    }
    config.trace |= cli.trace;

    let default_filter = if config.trace { "precode=trace" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let result = match cli.command {
        Commands::Layout => layout(&config, cli.format),
        Commands::Plan {
            count,
            dynamic,
            stable,
            special_cc,
        } => {
            let flags = MethodFlags {
                requires_md_calling_convention: special_cc,
                is_dynamic: dynamic,
                requires_stable_entry_point: stable,
                ..MethodFlags::default()
            };
            plan(&config, cli.format, count, flags)
        }
        #[cfg(feature = "image")]
        Commands::Image { action } => match action {
            ImageCommand::Build { methods, hot, out } => image_build(&config, methods, hot, &out),
            ImageCommand::Dump { file } => image_dump(&file, cli.format),
        },
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| format!("failed to serialize: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn layout(config: &EngineConfig, format: FormatArg) -> Result<(), String> {
    let caps = config.capabilities();
    let rows: Vec<LayoutRow> = PrecodeKind::ALL
        .into_iter()
        .map(|kind| LayoutRow {
            kind,
            size: caps.size_of(kind),
            alignment: caps.align_of(kind),
        })
        .collect();

    if format == FormatArg::Json {
        return print_json(&rows);
    }
    println!("isa: {}", caps.isa);
    for row in &rows {
        match row.size {
            Some(size) => {
                println!("{:<14} {:>3} bytes, align {}", row.kind.name(), size, row.alignment)
            }
            None => println!("{:<14}   - (unsupported)", row.kind.name()),
        }
    }
    Ok(())
}

fn plan(
    config: &EngineConfig,
    format: FormatArg,
    count: usize,
    flags: MethodFlags,
) -> Result<(), String> {
    let caps: &'static PrecodeCapabilities = config.capabilities();
    let plan: EntryPointPlan = TemporaryEntryPointAllocator::new(caps)
        .plan(&vec![flags; count])
        .map_err(|e| e.to_string())?;

    if format == FormatArg::Json {
        return print_json(&plan);
    }
    println!("isa: {}", caps.isa);
    println!("kind: {}", plan.kind);
    println!("count: {}", plan.count);
    println!("total size: {} bytes", plan.total_size);
    if plan.preallocate_jump_stubs {
        println!("jump stubs: preallocated");
    }
    if let Some(compact) = plan.compact_size {
        let verdict = if plan.uses_compact() { "used" } else { "not used" };
        println!("compact: {} bytes ({})", compact, verdict);
    }
    Ok(())
}

#[cfg(feature = "image")]
fn image_build(
    config: &EngineConfig,
    methods: u32,
    hot: u32,
    out: &std::path::Path,
) -> Result<(), String> {
    use precode::image::{DataImage, SaveChunk};
    use precode::{LoaderHeap, MethodDef, MethodDescChunk, PrecodeAccess};

    let heap = LoaderHeap::new(trampolines(), config.heap);
    let chunk = MethodDescChunk::new(
        heap,
        (0..methods).map(|i| MethodDef::new(format!("Method{}", i), 0x0600_0001 + i)),
    );

    let mut image = DataImage::new(config.capabilities());
    let mut save = SaveChunk::new();
    for (i, md) in chunk.iter().enumerate() {
        if (i as u32) < hot {
            image.set_method_profiling(md.token(), PrecodeAccess::READ);
        }
        save.add_precode_for_method(md, false);
    }
    save.save(&mut image).map_err(|e| e.to_string())?;

    let image = image.finish();
    image.save(out).map_err(|e| e.to_string())?;
    let summary = image.summary();
    println!(
        "wrote {} ({} nodes, {} relocations, {} surrogates)",
        out.display(),
        summary.nodes,
        summary.relocations,
        summary.surrogates
    );
    Ok(())
}

#[cfg(feature = "image")]
fn image_dump(file: &std::path::Path, format: FormatArg) -> Result<(), String> {
    let image = precode::image::PrecompiledImage::load(file).map_err(|e| e.to_string())?;
    let summary = image.summary();

    if format == FormatArg::Json {
        return print_json(&summary);
    }
    println!("isa: {}", summary.isa);
    for (kind, size) in &summary.sections {
        println!("section {:?}: {} bytes", kind, size);
    }
    println!("nodes: {}", summary.nodes);
    println!("relocations: {}", summary.relocations);
    println!("surrogates: {}", summary.surrogates);
    Ok(())
}
