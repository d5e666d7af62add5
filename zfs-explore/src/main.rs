use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use zfs_reader::{
    Dataset, Diagnostics, DirectorySink, ListingKind, Node, Object, Pool, PoolOptions,
};

#[derive(Parser)]
#[command(name = "zfs-explore", about = "Read-only explorer for ZFS pool images")]
struct Cli {
    /// Device or image file. Repeat for every top-level vdev.
    #[arg(short, long = "pool", required = true)]
    pools: Vec<PathBuf>,
    /// Treat all the given files as the children of one RAID-Z vdev.
    #[arg(long, value_name = "PARITY")]
    raidz: Option<u64>,
    /// Label position (0-3) to read the configuration from.
    #[arg(long)]
    label: Option<usize>,
    /// Open the pool as of this transaction group.
    #[arg(long)]
    txg: Option<u64>,
    /// Read and compare every copy of each block.
    #[arg(long)]
    thorough: bool,
    /// Write records that fail to decode into this directory.
    #[arg(long)]
    dump_dir: Option<PathBuf>,
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory or dataset.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Write a file's contents to stdout.
    Cat { path: String },
    /// Show the attributes of a file or directory.
    Stat { path: String },
    /// Print the dataset tree with snapshots.
    Datasets,
    /// Decode objects of the MOS or of a dataset's object set.
    Objset {
        /// `name` or `name@snapshot`; the MOS when omitted.
        #[arg(long)]
        dataset: Option<String>,
        #[arg(required_unless_present = "all")]
        index: Option<u64>,
        #[arg(long, conflicts_with = "index")]
        all: bool,
    },
    /// Show labels and uberblocks of every vdev.
    Labels,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {:#}", error);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut options = PoolOptions::default()
        .thorough(cli.thorough)
        .label(cli.label)
        .txg(cli.txg);
    if let Some(dir) = &cli.dump_dir {
        options = options.diagnostics(Diagnostics::new(Arc::new(DirectorySink::new(dir))));
    }
    let pool = match cli.raidz {
        Some(parity) => Pool::open_raidz(&cli.pools, parity, options),
        None => Pool::open_files(&cli.pools, options),
    }
    .context("failed to open pool")?;

    match cli.command {
        Command::Ls { path } => ls(&pool, &path),
        Command::Cat { path } => cat(&pool, &path),
        Command::Stat { path } => stat(&pool, &path),
        Command::Datasets => {
            let root = pool.root_dataset().context("no root dataset")?;
            datasets(&pool, root, 0, &mut BTreeSet::new())
        }
        Command::Objset {
            dataset,
            index,
            all,
        } => objset(&pool, dataset.as_deref(), index, all),
        Command::Labels => labels(&pool),
    }
}

fn ls(pool: &Pool, path: &str) -> Result<()> {
    let node = pool.open(path).with_context(|| format!("cannot open {}", path))?;
    for entry in node.list(pool)? {
        let tag = match entry.kind {
            ListingKind::Dataset => 'D',
            ListingKind::Entry(kind) => kind.tag(),
        };
        println!("{} {:>10} {}", tag, entry.object, entry.name);
    }
    Ok(())
}

fn cat(pool: &Pool, path: &str) -> Result<()> {
    let data = pool
        .read_file(path)
        .with_context(|| format!("cannot read {}", path))?;
    io::stdout().lock().write_all(&data)?;
    Ok(())
}

fn stat(pool: &Pool, path: &str) -> Result<()> {
    let attrs = match pool.open(path).with_context(|| format!("cannot open {}", path))? {
        Node::File(file) => &file.attributes,
        Node::Directory(dir, _) => match &dir.attributes {
            Some(attrs) => attrs,
            None => bail!("{} has no readable attributes", path),
        },
        Node::Dataset(dataset, fs) => {
            let (dir, _) = fs.root_directory(pool, &dataset.filesystem_label(pool, fs))?;
            match &dir.attributes {
                Some(attrs) => attrs,
                None => bail!("{} has no readable attributes", path),
            }
        }
        Node::Other(object) => bail!("{} is a {}", path, object.kind_name()),
    };
    println!("type:  {}", attrs.file_type().tag());
    println!("mode:  {:o}", attrs.permissions());
    println!("size:  {}", attrs.size);
    println!("owner: {}:{}", attrs.uid, attrs.gid);
    println!("links: {}", attrs.links);
    println!("mtime: {}", attrs.mtime);
    println!("ctime: {}", attrs.ctime);
    if let Some(target) = &attrs.symlink {
        println!("link:  {}", String::from_utf8_lossy(target));
    }
    Ok(())
}

fn datasets(pool: &Pool, dataset: &Dataset, depth: usize, seen: &mut BTreeSet<u64>) -> Result<()> {
    let indent = "  ".repeat(depth);
    if !seen.insert(dataset.index) {
        println!("{}(dsl dir {} already listed)", indent, dataset.index);
        return Ok(());
    }
    println!("{}{}", indent, dataset.name(pool)?);
    if dataset.head.is_some() {
        for (name, fs) in dataset.snapshots(pool)? {
            println!("{}  @{} (object {})", indent, name, fs.index);
        }
    }
    for (_, child) in dataset.children(pool)? {
        datasets(pool, child, depth + 1, seen)?;
    }
    Ok(())
}

fn objset(pool: &Pool, dataset: Option<&str>, index: Option<u64>, all: bool) -> Result<()> {
    let objset = match dataset {
        None => pool.mos()?,
        Some(expr) => match pool.dataset_for(expr)? {
            Node::Dataset(dataset, fs) => fs.objset(pool, &dataset.filesystem_label(pool, fs))?,
            _ => bail!("{} is not a dataset", expr),
        },
    };
    if !all {
        let index = index.context("an object index or --all is required")?;
        println!("{:#?}", objset.parse(pool, index)?);
        return Ok(());
    }
    for index in 0..objset.len() as u64 {
        match objset.parse(pool, index) {
            Ok(Object::None) => {}
            Ok(object) => println!("{:>8} {}", index, object.kind_name()),
            Err(e) => println!("{:>8} error: {}", index, e),
        }
    }
    Ok(())
}

fn labels(pool: &Pool) -> Result<()> {
    for vdev in pool.vdevs() {
        let labels = vdev.labels();
        println!("vdev {}", vdev.id());
        for label in labels.labels() {
            println!(
                "  label {}: txg {} with {} uberblocks",
                label.index,
                label.txg(),
                label.uberblocks.len()
            );
        }
        let active = labels.active_uberblock();
        println!("  active uberblock: txg {} rootbp {:?}", active.txg, active.rootbp);
    }
    Ok(())
}
