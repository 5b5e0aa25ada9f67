//! modgen command line tool.
//!
//! Usage: `modgen [--static-runtime] [--emit-source] [--mode M] [--store DIR] <command>`
//!
//! Flags override the `MODGEN_*` environment variables.

use clap::{Parser, Subcommand};
use modgen::{
    precompile, CodeGenerator, CompilationUnit, ConfigError, DirectoryStore, GenerationConfig,
    GenerationMode, LoadError, Loaded, RuntimeLoader, SourceEmitter, SymbolBinding,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "modgen")]
#[command(about = "Load, precompile or emit compilation units under one generation mode")]
struct Cli {
    /// Load precompiled images from the store
    #[arg(long, global = true)]
    static_runtime: bool,

    /// Emit C source instead of generating images
    #[arg(long, global = true)]
    emit_source: bool,

    /// Explicit mode: static, dynamic or source
    #[arg(long, global = true, value_parser = parse_mode)]
    mode: Option<GenerationMode>,

    /// Artifact store directory
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Give up waiting for another caller's generation after this many milliseconds
    #[arg(long = "timeout-ms", global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the resolved generation mode
    Mode,
    /// Load a unit under the resolved mode
    Load {
        file: PathBuf,
        /// Unit name (defaults to the file stem)
        #[arg(long)]
        name: Option<String>,
    },
    /// Generate images and persist them into the store
    Precompile {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the C source emitted for a unit
    Emit { file: PathBuf },
    /// Print the canonical IR dump of a unit
    Print { file: PathBuf },
}

fn parse_mode(value: &str) -> Result<GenerationMode, ConfigError> {
    value.parse()
}

impl Cli {
    /// Environment configuration with command line overrides applied.
    fn config(&self) -> Result<GenerationConfig, Box<dyn Error>> {
        let mut config = GenerationConfig::from_env()?;

        if self.static_runtime || self.emit_source {
            config.explicit_mode = None;
            if self.static_runtime {
                config.flags.runtime_static = true;
            }
            if self.emit_source {
                config.flags.generate_bytecode = false;
            }
        }
        if let Some(mode) = self.mode {
            let static_conflict = self.static_runtime && !mode.is_static();
            let source_conflict = self.emit_source && mode.is_dynamic();
            if static_conflict || source_conflict {
                return Err(ConfigError::InvariantViolation(format!(
                    "--mode {} contradicts --static-runtime={} --emit-source={}",
                    mode, self.static_runtime, self.emit_source
                ))
                .into());
            }
            config = config.with_mode(mode);
        }
        if let Some(store) = &self.store {
            config.store_root = Some(store.clone());
        }
        if let Some(ms) = self.timeout_ms {
            config.wait_timeout = Some(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

fn read_unit(file: &Path, name: Option<&str>) -> Result<CompilationUnit, Box<dyn Error>> {
    let unit = match name {
        Some(name) => CompilationUnit::from_path_named(name, file)?,
        None => CompilationUnit::from_path(file)?,
    };
    Ok(unit)
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let config = cli.config()?;

    match &cli.command {
        Command::Mode => {
            println!("mode: {}", config.mode());
            println!("runtime_static: {}", config.flags.runtime_static);
            println!("generate_bytecode: {}", config.flags.generate_bytecode);
            if let Some(root) = &config.store_root {
                println!("store: {}", root.display());
            }
        }
        Command::Load { file, name } => {
            let unit = read_unit(file, name.as_deref())?;
            let loader = RuntimeLoader::from_config(&config)?;
            match loader.load(&unit)? {
                Loaded::Executable(handle) => {
                    println!("{} loaded ({} mode)", handle.unit(), handle.provenance());
                    for symbol in handle.symbols() {
                        let binding = match symbol.binding {
                            SymbolBinding::Global => "global",
                            SymbolBinding::Local => "local",
                            SymbolBinding::Undefined => "undef",
                        };
                        println!(
                            "  {:<6} {:<24} offset {:#06x} size {}",
                            binding, symbol.name, symbol.offset, symbol.size
                        );
                    }
                }
                Loaded::ExternalCompileRequired(source) => {
                    println!(
                        "{}: external compile required ({} source, {} bytes)",
                        source.unit,
                        source.language,
                        source.text.len()
                    );
                }
            }
        }
        Command::Precompile { files } => {
            let root = config
                .store_root
                .clone()
                .ok_or("precompile needs --store or MODGEN_STORE")?;
            let store = DirectoryStore::open(root)?;
            for file in files {
                let unit = read_unit(file, None)?;
                let image = precompile(&unit, &store)?;
                println!(
                    "{} -> {} ({} bytes)",
                    unit.id(),
                    store.path_for(unit.id()).display(),
                    image.len()
                );
            }
        }
        Command::Emit { file } => {
            let unit = read_unit(file, None)?;
            let artifact = SourceEmitter::new().generate(&unit)?;
            if let Some(source) = artifact.source() {
                print!("{}", source.text);
            }
        }
        Command::Print { file } => {
            let unit = read_unit(file, None)?;
            print!("{}", unit.module().print());
        }
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("error: {}", err);
        let code = match err.downcast_ref::<LoadError>() {
            Some(LoadError::MissingPrecompiledArtifact { .. }) => 2,
            _ => 1,
        };
        process::exit(code);
    }
}
