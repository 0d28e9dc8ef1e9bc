use std::{
    fs::DirBuilder,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use spoollib::{
    convert::{
        compile::{compile, CompileOptions, MeshDescription},
        convert,
        directory::GlobalMaterials,
        weld::DEFAULT_WELD_TOLERANCE,
        ConvertOptions,
    },
    format::{
        chunk::{Chunk, ChunkFile, K_CHUNK_CHNK},
        mdpc::{LodSlot, ModelPackage, K_CHUNK_MDPC},
        peek_four_cc, FormatVersion, Uid,
    },
    util::file::{create_file, map_file},
};

use crate::cmd::gltf::export_gltf;

// Leaf alignment used for newly created containers
const MDPC_ALIGN: u8 = 4;

#[derive(FromArgs, PartialEq, Debug)]
/// process model packages
#[argh(subcommand, name = "mdpc")]
pub struct Args {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Info(InfoArgs),
    Convert(ConvertArgs),
    Export(ExportArgs),
    Import(ImportArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// prints a summary of every model package
#[argh(subcommand, name = "info")]
pub struct InfoArgs {
    #[argh(positional)]
    /// input chunk file or bare package
    input: PathBuf,
}

#[derive(FromArgs, PartialEq, Debug)]
/// converts model packages to another format version
#[argh(subcommand, name = "convert")]
pub struct ConvertArgs {
    #[argh(positional)]
    /// input chunk file or bare package
    input: PathBuf,
    #[argh(positional)]
    /// output file
    output: PathBuf,
    #[argh(option, short = 't')]
    /// target version (driv3r, dpl)
    target: FormatVersion,
    #[argh(option, short = 'u')]
    /// UID of the converted packages (low:high)
    uid: Option<Uid>,
    #[argh(option, short = 'g')]
    /// file with global material packages (repeatable)
    globals: Vec<PathBuf>,
    #[argh(option, default = "DEFAULT_WELD_TOLERANCE")]
    /// vertex weld tolerance
    tolerance: f32,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// exports model packages to glTF
#[argh(subcommand, name = "export")]
pub struct ExportArgs {
    #[argh(positional)]
    /// input chunk file or bare package
    input: PathBuf,
    #[argh(positional)]
    /// output directory
    out_dir: PathBuf,
}

#[derive(FromArgs, PartialEq, Debug)]
/// compiles a JSON mesh description into a chunk file
#[argh(subcommand, name = "import")]
pub struct ImportArgs {
    #[argh(positional)]
    /// input mesh description
    input: PathBuf,
    #[argh(positional)]
    /// output chunk file
    output: PathBuf,
    #[argh(option, short = 't', default = "FormatVersion::Dpl")]
    /// package version (driv3r, dpl)
    target: FormatVersion,
    #[argh(option, short = 'u')]
    /// package UID (low:high)
    uid: Option<Uid>,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Info(c_args) => info(c_args),
        SubCommand::Convert(c_args) => convert_file(c_args),
        SubCommand::Export(c_args) => export(c_args),
        SubCommand::Import(c_args) => import(c_args),
    }
}

/// Decodes every model package in a chunk file, or the file itself if it is
/// a bare package.
fn read_packages(path: &Path) -> Result<Vec<ModelPackage>> {
    let data = map_file(path)?;
    let result = match peek_four_cc(&data) {
        K_CHUNK_CHNK => {
            let file = ChunkFile::read(&data)?;
            file.find_all(K_CHUNK_MDPC)
                .into_iter()
                .filter_map(Chunk::bytes)
                .map(ModelPackage::read)
                .collect::<Result<Vec<_>>>()
        }
        K_CHUNK_MDPC => ModelPackage::read(&data).map(|p| vec![p]),
        magic => bail!("Unknown file type {magic:?}"),
    };
    result.with_context(|| format!("Failed to read '{}'", path.display()))
}

fn info(args: InfoArgs) -> Result<()> {
    let packages = read_packages(&args.input)?;
    if packages.is_empty() {
        log::warn!("No model packages in '{}'", args.input.display());
    }
    for (index, package) in packages.iter().enumerate() {
        println!("Package {index}: {} ({})", package.uid, package.version);
        println!(
            "  {:?} vertices: {}",
            package.vertex_declaration,
            package
                .vertex_buffers
                .iter()
                .map(|b| b.vertex_count().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        println!("  Indices: {}", package.indices.len());
        for (model_index, model) in package.models.iter().enumerate() {
            println!("  Model {model_index}: flags {:#06X}", model.flags);
            for (slot, lod) in LodSlot::ALL.iter().zip(&model.lods) {
                let Some(lod) = lod else { continue };
                let submodels: usize = lod.instances.iter().map(|i| i.submodels.len()).sum();
                println!(
                    "    {slot:?}: {} instances, {submodels} submodels, mask {:#X}",
                    lod.instances.len(),
                    lod.mask
                );
            }
        }
        println!(
            "  Materials: {}, textures: {}",
            package.materials.materials.len(),
            package.materials.textures.len()
        );
        for (texture_index, texture) in package.materials.textures.iter().enumerate() {
            println!(
                "    Texture {texture_index}: {:08X} {}x{} ({} bytes)",
                texture.uid,
                texture.width,
                texture.height,
                texture.data.len()
            );
        }
    }
    Ok(())
}

fn load_globals(paths: &[PathBuf]) -> Result<GlobalMaterials> {
    let mut globals = GlobalMaterials::new();
    for path in paths {
        let data = map_file(path)?;
        match peek_four_cc(&data) {
            K_CHUNK_CHNK => {
                let file = ChunkFile::read(&data)?;
                let count = globals
                    .insert_chunks(&file)
                    .with_context(|| format!("Failed to read '{}'", path.display()))?;
                log::debug!("{count} global packages in '{}'", path.display());
            }
            K_CHUNK_MDPC => globals.insert(&ModelPackage::read(&data)?),
            magic => bail!("Unknown file type {magic:?} in '{}'", path.display()),
        }
    }
    if !globals.is_empty() {
        log::info!("Loaded {} global material tables", globals.len());
    }
    Ok(globals)
}

fn convert_file(args: ConvertArgs) -> Result<()> {
    let globals = load_globals(&args.globals)?;
    let options =
        ConvertOptions { target: args.target, target_uid: args.uid, tolerance: args.tolerance };
    let convert_one = |data: &[u8]| -> Result<Vec<u8>> {
        let source = ModelPackage::read(data)?;
        let result = convert(&source, &options, &globals)?;
        for diagnostic in &result.diagnostics {
            log::warn!("{diagnostic}");
        }
        result.package.write()
    };

    let data = map_file(&args.input)?;
    let mut w = create_file(&args.output)?;
    match peek_four_cc(&data) {
        K_CHUNK_CHNK => {
            let mut file = ChunkFile::read(&data)?;
            let mut count = 0;
            file.visit_leaves_mut(K_CHUNK_MDPC, &mut |chunk| {
                let Some(bytes) = chunk.bytes() else { return Ok(()) };
                let converted = convert_one(bytes)?;
                chunk.replace_data(converted);
                count += 1;
                Ok(())
            })?;
            file.write(&mut w)?;
            log::info!("Converted {count} model packages");
        }
        K_CHUNK_MDPC => w.write_all(&convert_one(&data)?)?,
        magic => bail!("Unknown file type {magic:?}"),
    }
    w.flush()?;
    Ok(())
}

fn export(args: ExportArgs) -> Result<()> {
    let packages = read_packages(&args.input)?;
    DirBuilder::new().recursive(true).create(&args.out_dir)?;
    let stem = args.input.file_stem().and_then(|s| s.to_str()).unwrap_or("out").to_string();
    for (index, package) in packages.iter().enumerate() {
        let name = if packages.len() == 1 { stem.clone() } else { format!("{stem}_{index}") };
        let bin_name = format!("{name}.bin");
        let (root, data) = export_gltf(package, &bin_name)?;
        let mut w = create_file(args.out_dir.join(&bin_name))?;
        w.write_all(&data)?;
        w.flush()?;
        let mut w = create_file(args.out_dir.join(format!("{name}.gltf")))?;
        gltf_json::serialize::to_writer_pretty(&mut w, &root)?;
        w.flush()?;
        log::info!("Exported {} to '{}'", package.uid, args.out_dir.join(&name).display());
    }
    Ok(())
}

fn import(args: ImportArgs) -> Result<()> {
    let data = map_file(&args.input)?;
    let mesh: MeshDescription = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse '{}'", args.input.display()))?;
    let options = CompileOptions {
        version: args.target,
        uid: args.uid.unwrap_or_default(),
        ..Default::default()
    };
    let package = compile(&mesh, &options)?;
    let file = ChunkFile::new(vec![Chunk::buffer(K_CHUNK_MDPC, 0, MDPC_ALIGN, package.write()?)]);
    let mut w = create_file(&args.output)?;
    file.write(&mut w)?;
    w.flush()?;
    Ok(())
}
