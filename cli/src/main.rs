//! Thin command-line wrapper over the `os8_fs` Engine API (spec.md §6):
//! argument parsing and verb dispatch only. The text-file transcoder,
//! interactive confirmation prompts, and host path globbing spec.md places
//! out of scope (§1) are not reimplemented here.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::error;

use os8_ds_std::DataStorageServer;
use os8_err::{Result, UsageError};
use os8_fs::codec::RkSide;
use os8_fs::device::Format;
use os8_fs::directory::model::{Entry, SixBitName};
use os8_fs::image::{self, ImageHandle, ListEntry};
use os8_fs::pattern::Pattern;

#[derive(Parser)]
#[command(
    name = "os8fs",
    about = "Copy, list, delete, create, and zero OS/8 filesystem images"
)]
struct Cli {
    /// Path to the host file holding the OS/8 device image.
    #[arg(long, value_name = "PATH")]
    os8: PathBuf,

    /// RK05 3:2-packed 384-byte blocks; see --rka/--rkb for platter side.
    #[arg(long)]
    rk05: bool,
    /// DECtape 129-word media blocks (128 OS/8-visible), the TU56 drive.
    #[arg(long)]
    tu56: bool,
    /// Synonym for --tu56.
    #[arg(long)]
    dt8: bool,
    /// Plain 256-word, 512-byte blocks. Default when no format flag is given.
    #[arg(long)]
    dsk: bool,

    /// Select the first RK05 platter (default with --rk05).
    #[arg(long)]
    rka: bool,
    /// Select the second RK05 platter, offset +3248 blocks.
    #[arg(long)]
    rkb: bool,

    /// List the directory.
    #[arg(long)]
    dir: bool,
    /// With --dir, also list empty (free) entries.
    #[arg(long)]
    empties: bool,
    /// With --dir, lay the listing out in N columns.
    #[arg(long, value_name = "N")]
    columns: Option<usize>,

    /// Delete files matching the given os8: patterns.
    #[arg(long)]
    delete: bool,
    /// With --delete, suppress the per-operation log chatter (the final
    /// "N files deleted" summary is always printed).
    #[arg(long)]
    quiet: bool,

    /// Write a fresh directory, sizing the image from the host file's length.
    #[arg(long)]
    create: bool,
    /// With --create, silently do nothing if the destination already exists
    /// (no confirmation prompt is implemented; see DESIGN.md).
    #[arg(long)]
    exists: bool,

    /// Reset the directory to a single empty entry (engine's zero_filesystem).
    #[arg(long)]
    zero: bool,

    /// File specs. For the default copy verb: one or more sources followed
    /// by a destination. For --dir: an optional pattern. For --delete: one
    /// or more patterns.
    files: Vec<String>,
}

fn strip_os8_prefix(spec: &str) -> Option<&str> {
    spec.strip_prefix("os8:")
}

fn resolve_format(cli: &Cli) -> Result<Format> {
    if (cli.rka || cli.rkb) && !cli.rk05 {
        return Err(UsageError::WrongArity("--rka/--rkb require --rk05".into()).into());
    }
    if cli.rka && cli.rkb {
        return Err(UsageError::WrongArity("--rka and --rkb are mutually exclusive".into()).into());
    }
    let dectape = cli.tu56 || cli.dt8;
    match (cli.rk05, dectape, cli.dsk) {
        (true, false, false) => Ok(Format::Rk05 {
            side: if cli.rkb { RkSide::B } else { RkSide::A },
        }),
        (false, true, false) => Ok(Format::Dectape),
        (false, false, true) => Ok(Format::Dsk),
        (false, false, false) => Ok(Format::Dsk),
        _ => Err(UsageError::WrongArity("at most one of --rk05/--tu56/--dt8/--dsk".into()).into()),
    }
}

fn open(cli: &Cli, allow_create: bool) -> Result<ImageHandle<DataStorageServer>> {
    let format = resolve_format(cli)?;
    let storage = DataStorageServer::open(&cli.os8, allow_create)?;
    Ok(image::open_image(storage, format))
}

fn do_create(cli: &Cli) -> Result<()> {
    if cli.exists && cli.os8.exists() {
        return Ok(());
    }
    let handle = open(cli, true)?;
    let mut dir = handle.create()?;
    handle.flush(&mut dir)
}

fn do_zero(cli: &Cli) -> Result<()> {
    let handle = open(cli, false)?;
    let mut dir = handle.read_directory()?;
    handle.zero(&mut dir)?;
    handle.flush(&mut dir)
}

fn print_columns(entries: &[ListEntry], columns: usize) {
    let columns = columns.max(1);
    let labels: Vec<String> = entries
        .iter()
        .map(|e| match &e.name {
            Some(name) => format!("{name:<10}{:>4}", e.length),
            None => format!("{:<10}{:>4}", "<EMPTY>", e.length),
        })
        .collect();
    for chunk in labels.chunks(columns) {
        println!("{}", chunk.join("  "));
    }
}

fn do_list(cli: &Cli) -> Result<()> {
    let handle = open(cli, false)?;
    let dir = handle.read_directory()?;
    let pattern = cli
        .files
        .first()
        .map(|spec| Pattern::compile(strip_os8_prefix(spec).unwrap_or(spec)))
        .transpose()?;

    let summary = handle.list(&dir, pattern.as_ref(), cli.empties);
    print_columns(&summary.entries, cli.columns.unwrap_or(1));
    println!(
        "{} Files In {} Blocks - {} Free Blocks",
        summary.file_count, summary.used_blocks, summary.free_blocks
    );
    Ok(())
}

fn do_delete(cli: &Cli) -> Result<()> {
    if cli.files.is_empty() {
        return Err(UsageError::WrongArity("--delete requires at least one os8: pattern".into()).into());
    }
    let handle = open(cli, false)?;
    let mut dir = handle.read_directory()?;
    let patterns = cli
        .files
        .iter()
        .map(|spec| Pattern::compile(strip_os8_prefix(spec).unwrap_or(spec)))
        .collect::<Result<Vec<_>>>()?;

    let count = handle.delete_many(&mut dir, &patterns, cli.quiet)?;
    handle.flush(&mut dir)?;
    println!("{count} files deleted");
    Ok(())
}

fn copy_host_to_os8(cli: &Cli, sources: &[String], dest_spec: &str) -> Result<()> {
    let dest_name = strip_os8_prefix(dest_spec).expect("caller checked the os8: prefix");
    if sources.len() > 1 && !dest_name.is_empty() {
        return Err(UsageError::DestinationNotDirectory(dest_spec.to_string()).into());
    }

    let handle = open(cli, false)?;
    let mut dir = handle.read_directory()?;
    for source in sources {
        let path = Path::new(source);
        let name = if dest_name.is_empty() {
            let basename = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| UsageError::IllegalName(source.clone()))?;
            SixBitName::parse(basename)?
        } else {
            SixBitName::parse(dest_name)?
        };
        let len = fs::metadata(path)?.len();
        let file = File::open(path)?;
        handle.copy_in(&mut dir, name, len, BufReader::new(file))?;
    }
    handle.flush(&mut dir)
}

fn copy_os8_to_host(cli: &Cli, sources: &[String], dest: &str) -> Result<()> {
    let handle = open(cli, false)?;
    let dir = handle.read_directory()?;
    let dest_path = Path::new(dest);

    let multi_source = sources.len() > 1
        || sources.first().is_some_and(|s| {
            strip_os8_prefix(s).is_some_and(|p| p.contains('*'))
        });
    if multi_source && !dest_path.is_dir() {
        return Err(UsageError::DestinationNotDirectory(dest.to_string()).into());
    }

    for source in sources {
        let pattern_spec = strip_os8_prefix(source).ok_or_else(|| UsageError::IllegalName(source.clone()))?;
        let pattern = Pattern::compile(pattern_spec)?;
        let mut matched = false;
        for entry_ref in handle.lookup_all(&dir, pattern) {
            matched = true;
            let name = match &entry_ref.entry {
                Entry::File { name, .. } => name.display(),
                Entry::Empty { .. } => continue,
            };
            let out_path = if dest_path.is_dir() {
                dest_path.join(&name)
            } else {
                dest_path.to_path_buf()
            };
            let mut out = File::create(&out_path)?;
            handle.copy_out(&entry_ref, &mut out)?;
        }
        if !matched {
            error!("no file matches {source}");
        }
    }
    Ok(())
}

fn do_copy(cli: &Cli) -> Result<()> {
    if cli.files.len() < 2 {
        return Err(
            UsageError::WrongArity("copy requires at least one source and a destination".into()).into(),
        );
    }
    let (sources, dest) = cli.files.split_at(cli.files.len() - 1);
    let dest = &dest[0];

    let dest_is_os8 = strip_os8_prefix(dest).is_some();
    let sources_are_os8 = sources.iter().all(|s| strip_os8_prefix(s).is_some());
    match (dest_is_os8, sources_are_os8) {
        (true, false) => copy_host_to_os8(cli, sources, dest),
        (false, true) => copy_os8_to_host(cli, sources, dest),
        _ => Err(UsageError::WrongArity(
            "copy direction is inferred from which side carries the os8: prefix".into(),
        )
        .into()),
    }
}

fn run(cli: &Cli) -> Result<()> {
    if cli.create {
        do_create(cli)
    } else if cli.zero {
        do_zero(cli)
    } else if cli.dir {
        do_list(cli)
    } else if cli.delete {
        do_delete(cli)
    } else {
        do_copy(cli)
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
