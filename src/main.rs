use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use meshport::pipeline::{self, ConversionContext, ShapeDescriptor, DEFAULT_MESH_DIR};

#[derive(Parser, Debug)]
#[command(name = "meshport")]
#[command(version, about = "Converts scene shapes into canonical binary polygon files")]
struct Args {
    /// Shape manifest, a JSON array of shape descriptors
    input: PathBuf,

    /// Converted shape list to write [default: <input stem>.meshes.json beside the input]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for converted meshes, relative to the output file
    #[arg(long, default_value = DEFAULT_MESH_DIR)]
    mesh_dir: PathBuf,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir().context("cannot determine working directory")?.join(path))
    }
}

fn parent_directory(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let input = absolute(&args.input)?;
    let output = match &args.output {
        Some(output) => absolute(output)?,
        None => input.with_extension("meshes.json"),
    };

    let manifest = fs::read_to_string(&input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let descriptors: Vec<ShapeDescriptor> = serde_json::from_str(&manifest)
        .with_context(|| format!("{} is not a valid shape manifest", input.display()))?;

    let mut context = ConversionContext::new(parent_directory(&input), parent_directory(&output))
        .with_mesh_dir(&args.mesh_dir);
    let converted = pipeline::convert_shapes(&mut context, &descriptors);
    info!("converted {} of {} shapes", converted.len(), descriptors.len());

    fs::write(&output, serde_json::to_string_pretty(&converted)?)
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(())
}
