use clap::{Parser, Subcommand};
use eyre::{ensure, Context, Result};
use sectorfs::disk::{DiskImage, DiskImageHeader};
use sectorfs::FileSystem;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::trace;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
struct Cli {
    /// Disk image holding the file system
    #[arg(index = 1)]
    image: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new image with an empty file system
    Format {
        #[arg(short = 's', long, default_value_t = DiskImageHeader::DEFAULT_SECTOR_COUNT)]
        sectors: usize,
    },
    /// Copy a host file into the file system
    Copy {
        #[arg(index = 1)]
        host: PathBuf,
        #[arg(index = 2)]
        path: String,
    },
    /// Write a file's contents to stdout
    Print {
        #[arg(index = 1)]
        path: String,
    },
    /// Create an empty directory
    Mkdir {
        #[arg(index = 1)]
        path: String,
    },
    /// List a directory, with -r descending into sub-directories
    Ls {
        #[arg(short = 'r', long)]
        recursive: bool,
        #[arg(index = 1, default_value = "/")]
        path: String,
    },
    /// Remove a file, with -r a directory and everything below it
    Rm {
        #[arg(short = 'r', long)]
        recursive: bool,
        #[arg(index = 1)]
        path: String,
    },
    /// Remove an empty directory
    Rmdir {
        #[arg(index = 1)]
        path: String,
    },
    /// Show a file's length and the space taken by its headers
    HeaderSize {
        #[arg(index = 1)]
        path: String,
    },
    /// Describe the bitmap and the root directory
    Dump,
}

fn mount(image: &Path) -> Result<FileSystem<DiskImage>> {
    let disk = DiskImage::open(image)?;
    FileSystem::mount(disk).wrap_err("Failed to mount file system")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
    trace!("Starting up sectorfs cli");
    match cli.command {
        Command::Format { sectors } => {
            DiskImage::create(&cli.image, sectors).wrap_err("Failed to create disk image")?;
            let disk = DiskImage::open(&cli.image)?;
            FileSystem::format(disk).wrap_err("Failed to format file system")?;
        }
        Command::Copy { host, path } => {
            let data = std::fs::read(&host).wrap_err_with(|| format!("Couldn't read {host:?}"))?;
            let mut fs = mount(&cli.image)?;
            fs.create(&path, data.len())
                .wrap_err_with(|| format!("Failed to create {path}"))?;
            let mut file = fs.open(&path)?;
            let written = fs.write(&mut file, &data)?;
            ensure!(
                written == data.len(),
                "Only {} of {} bytes were written",
                written,
                data.len()
            );
        }
        Command::Print { path } => {
            let mut fs = mount(&cli.image)?;
            let mut file = fs.open(&path).wrap_err_with(|| format!("Failed to open {path}"))?;
            let mut data = vec![0; file.length()];
            fs.read(&mut file, &mut data)?;
            let mut stdout = std::io::stdout();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
        Command::Mkdir { path } => {
            mount(&cli.image)?
                .create_subdir(&path)
                .wrap_err_with(|| format!("Failed to create directory {path}"))?;
        }
        Command::Ls { recursive, path } => {
            let mut fs = mount(&cli.image)?;
            let listing = if recursive {
                fs.recursive_list(&path)?
            } else {
                fs.list(&path)?
            };
            print!("{listing}");
        }
        Command::Rm { recursive, path } => {
            let mut fs = mount(&cli.image)?;
            let removed = if recursive {
                fs.recursive_remove(&path)
            } else {
                fs.remove(&path)
            };
            removed.wrap_err_with(|| format!("Failed to remove {path}"))?;
        }
        Command::Rmdir { path } => {
            mount(&cli.image)?
                .remove_dir(&path)
                .wrap_err_with(|| format!("Failed to remove directory {path}"))?;
        }
        Command::HeaderSize { path } => {
            let (length, headers) = mount(&cli.image)?.header_size(&path)?;
            println!("{path}: {length} bytes of data, {headers} bytes of headers");
        }
        Command::Dump => {
            print!("{}", mount(&cli.image)?.dump()?);
        }
    }
    Ok(())
}
