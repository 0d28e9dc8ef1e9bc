use std::{
    fs,
    io::{stdout, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use argh::FromArgs;
use spoollib::{
    format::chunk::{dump_chunks, ChunkData, ChunkFile},
    util::file::{create_file, map_file},
};

#[derive(FromArgs, PartialEq, Debug)]
/// process chunk files
#[argh(subcommand, name = "chnk")]
pub struct Args {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Dump(DumpArgs),
    Extract(ExtractArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// prints the chunk tree
#[argh(subcommand, name = "dump")]
pub struct DumpArgs {
    #[argh(positional)]
    /// input file
    input: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// extracts every leaf chunk
#[argh(subcommand, name = "extract")]
pub struct ExtractArgs {
    #[argh(positional)]
    /// input file
    input: PathBuf,
    #[argh(positional)]
    /// output directory
    output: PathBuf,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Dump(c_args) => dump(c_args),
        SubCommand::Extract(c_args) => extract(c_args),
    }
}

fn dump(args: DumpArgs) -> Result<()> {
    let data = map_file(&args.input)?;
    let file = ChunkFile::read(&data)
        .with_context(|| format!("Failed to read '{}'", args.input.display()))?;
    let mut out = stdout().lock();
    writeln!(out, "{} (version {})", args.input.display(), file.version)?;
    dump_chunks(&mut out, &file, 1)?;
    Ok(())
}

fn extract(args: ExtractArgs) -> Result<()> {
    let data = map_file(&args.input)?;
    let file = ChunkFile::read(&data)
        .with_context(|| format!("Failed to read '{}'", args.input.display()))?;
    let count = extract_dir(&file, &args.output)?;
    log::info!("Extracted {count} chunks to '{}'", args.output.display());
    Ok(())
}

/// Writes each leaf as `<index>_<id>.bin`; nested containers become directories.
fn extract_dir(file: &ChunkFile, dir: &Path) -> Result<usize> {
    let mut count = 0;
    for (index, child) in file.children.iter().enumerate() {
        let name = format!("{index:03}_{}", sanitize(&child.id.to_string()));
        match &child.data {
            ChunkData::Buffer(data) => {
                let path = dir.join(format!("{name}.bin"));
                log::debug!("{:?} -> '{}'", child.id, path.display());
                let mut w = create_file(&path)?;
                w.write_all(data)?;
                w.flush()?;
                count += 1;
            }
            ChunkData::Package(package) => {
                let path = dir.join(name);
                fs::create_dir_all(&path)
                    .with_context(|| format!("Failed to create directory '{}'", path.display()))?;
                count += extract_dir(package, &path)?;
            }
        }
    }
    Ok(count)
}

fn sanitize(id: &str) -> String {
    id.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}
