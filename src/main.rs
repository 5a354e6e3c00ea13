//! densitree - disk usage analyzer built around a cooperative read-job
//! engine.
//!
//! Usage:
//!   densitree [PATH]                Scan a directory, print a size tree
//!   densitree pkg [PATTERN]         Scan installed packages
//!   densitree write-cache [PATH]    Scan and store a snapshot
//!   densitree read-cache FILE       Rebuild a tree from a snapshot
//!   densitree --help                Show help

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Context, Result};
use tracing_subscriber::EnvFilter;

use densitree_core::{
    ExcludeRule, ExcludeRules, NodeId, PatternSyntax, ReadState, ScanOptions, Settings, Tree,
};
use densitree_scan::{CacheWriter, JobQueue, MountTable, PkgFilter, PkgReader, DEFAULT_CACHE_NAME};

#[derive(Parser)]
#[command(
    name = "densitree",
    version,
    about = "A disk usage analyzer",
    long_about = "densitree shows where your disk space goes.\n\n\
                  Scan a directory tree, the file lists of installed \
                  packages, or a stored snapshot; directories containing \
                  a snapshot file are read from it instead of the disk."
)]
struct Cli {
    /// Path to scan (defaults to the current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Cross filesystem boundaries instead of stopping at mount points
    #[arg(short = 'x', long)]
    cross_filesystems: bool,

    /// Exclude directories matching this wildcard pattern (repeatable)
    #[arg(short, long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,

    /// Maximum tree depth to display
    #[arg(short, long, default_value = "3")]
    depth: u32,

    /// Number of entries to show per directory
    #[arg(short = 'n', long, default_value = "10")]
    top: usize,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the file lists of installed packages
    Pkg {
        /// Package name pattern (substring or wildcard; empty selects all)
        #[arg(default_value = "")]
        pattern: String,

        /// Number of packages to show
        #[arg(short = 'n', long, default_value = "20")]
        top: usize,
    },

    /// Scan a directory and store the result as a snapshot
    WriteCache {
        /// Path to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output file (defaults to the snapshot name inside PATH)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rebuild a tree from a snapshot file
    ReadCache {
        /// Snapshot file
        file: PathBuf,

        /// Maximum tree depth to display
        #[arg(short, long, default_value = "3")]
        depth: u32,

        /// Number of entries to show per directory
        #[arg(short = 'n', long, default_value = "10")]
        top: usize,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Pkg { pattern, top }) => run_pkg(&pattern, top),
        Some(Command::WriteCache { path, output }) => {
            run_write_cache(&path, output, cli.cross_filesystems, &cli.excludes)
        }
        Some(Command::ReadCache { file, depth, top }) => run_read_cache(&file, depth, top),
        None => run_scan(
            &cli.path,
            cli.cross_filesystems,
            &cli.excludes,
            cli.depth,
            cli.top,
        ),
    }
}

fn build_queue(cross_filesystems: bool, excludes: &[String]) -> Result<JobQueue> {
    let mut rules = Vec::new();
    for pattern in excludes {
        rules.push(ExcludeRule::new(pattern, PatternSyntax::Wildcard)?);
    }

    let options = ScanOptions::builder()
        .cross_filesystems(cross_filesystems)
        .build()?;

    Ok(JobQueue::new(
        options,
        Arc::new(ExcludeRules::new(rules)),
        Arc::new(MountTable::from_system()),
    ))
}

/// Scan a directory and print the size tree.
fn run_scan(
    path: &PathBuf,
    cross_filesystems: bool,
    excludes: &[String],
    depth: u32,
    top_n: usize,
) -> Result<()> {
    let path = path.canonicalize().context("Invalid path")?;
    eprintln!("Scanning {}...", path.display());

    let mut tree = Tree::new();
    let mut queue = build_queue(cross_filesystems, excludes)?;

    let start = Instant::now();
    let top = queue.open_dir(&mut tree, &path)?;
    queue.run_to_completion(&mut tree);

    print_summary(&tree, top, start.elapsed().as_secs_f64());
    print_node(&tree, top, 0, depth, top_n, tree.total_size(top));
    Ok(())
}

/// Scan installed packages and print the heaviest ones.
fn run_pkg(pattern: &str, top_n: usize) -> Result<()> {
    let filter = PkgFilter::parse(pattern)?;
    let settings = Settings::load_default();

    eprintln!("Reading installed packages...");

    let mut tree = Tree::new();
    let mut queue = build_queue(false, &[])?;

    let start = Instant::now();
    let reader = PkgReader::new(&settings);
    reader.read(&mut tree, &mut queue, &filter);
    queue.run_to_completion(&mut tree);

    let Some(pkg_root) = tree.first_toplevel() else {
        println!("No packages found.");
        return Ok(());
    };

    print_summary(&tree, pkg_root, start.elapsed().as_secs_f64());

    let mut pkgs: Vec<NodeId> = tree.children(pkg_root).to_vec();
    pkgs.sort_by_key(|&id| std::cmp::Reverse(tree.total_size(id)));

    for &pkg in pkgs.iter().take(top_n) {
        let Some(node) = tree.node(pkg) else { continue };
        println!(
            " {:<40} {:>10} {:>7} files{}",
            node.name,
            format_size(tree.total_size(pkg)),
            tree.total_files(pkg),
            state_marker(&tree, pkg)
        );
    }
    let remaining = pkgs.len().saturating_sub(top_n);
    if remaining > 0 {
        println!(" ... and {remaining} more");
    }
    Ok(())
}

/// Scan a directory and store the result as a snapshot file.
fn run_write_cache(
    path: &PathBuf,
    output: Option<PathBuf>,
    cross_filesystems: bool,
    excludes: &[String],
) -> Result<()> {
    let path = path.canonicalize().context("Invalid path")?;
    let output = output.unwrap_or_else(|| path.join(DEFAULT_CACHE_NAME));

    eprintln!("Scanning {}...", path.display());

    let mut tree = Tree::new();
    let mut queue = build_queue(cross_filesystems, excludes)?;
    let top = queue.open_dir(&mut tree, &path)?;
    queue.run_to_completion(&mut tree);

    CacheWriter::write(&tree, top, &output)?;
    eprintln!(
        "Stored {} items in {}",
        tree.total_items(top),
        output.display()
    );
    Ok(())
}

/// Rebuild a tree from a snapshot file and print it.
fn run_read_cache(file: &PathBuf, depth: u32, top_n: usize) -> Result<()> {
    eprintln!("Reading snapshot {}...", file.display());

    let mut tree = Tree::new();
    let mut queue = build_queue(false, &[])?;

    let start = Instant::now();
    queue.read_cache(&mut tree, file)?;
    queue.run_to_completion(&mut tree);

    let Some(top) = tree.first_toplevel() else {
        println!("Empty snapshot.");
        return Ok(());
    };

    print_summary(&tree, top, start.elapsed().as_secs_f64());
    print_node(&tree, top, 0, depth, top_n, tree.total_size(top));
    Ok(())
}

fn print_summary(tree: &Tree, top: NodeId, elapsed: f64) {
    println!();
    println!("{}", "─".repeat(60));
    println!(
        " {} - {}",
        tree.url_of(top).display(),
        format_size(tree.total_size(top))
    );
    println!(
        " {} files, {} directories",
        tree.total_files(top),
        tree.total_subdirs(top)
    );
    println!(" Read in {elapsed:.2}s");
    println!("{}", "─".repeat(60));
    println!();
}

/// Print a node and its children, largest first.
fn print_node(tree: &Tree, id: NodeId, depth: u32, max_depth: u32, top_n: usize, root_size: u64) {
    let Some(node) = tree.node(id) else { return };

    let size = tree.total_size(id);
    let ratio = if root_size > 0 {
        size as f64 / root_size as f64 * 100.0
    } else {
        0.0
    };

    let indent = "  ".repeat(depth as usize);
    let dir_marker = if node.is_dir() { "/" } else { "" };

    println!(
        "{}{}{:<40} {:>10} {:>5.1}% {}{}",
        indent,
        if node.is_dir() { "▼ " } else { "  " },
        truncate(&format!("{}{}", node.name, dir_marker), 40),
        format_size(size),
        ratio,
        make_bar(ratio / 100.0, 10),
        state_marker(tree, id)
    );

    if node.is_dir() && depth < max_depth {
        let mut children: Vec<NodeId> = tree.children(id).to_vec();
        children.sort_by_key(|&c| std::cmp::Reverse(tree.total_size(c)));

        for &child in children.iter().take(top_n) {
            print_node(tree, child, depth + 1, max_depth, top_n, root_size);
        }

        let remaining = children.len().saturating_sub(top_n);
        if remaining > 0 {
            let indent = "  ".repeat((depth + 1) as usize);
            println!("{indent}  ... and {remaining} more");
        }
    }
}

fn state_marker(tree: &Tree, id: NodeId) -> &'static str {
    match tree.read_state(id) {
        Some(ReadState::Error) => " [error]",
        Some(ReadState::OnRequestOnly) => " [not read]",
        Some(ReadState::Aborted) => " [aborted]",
        _ => "",
    }
}

/// Create a simple ASCII bar.
fn make_bar(ratio: f64, width: usize) -> String {
    let filled = (ratio * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len - 1).collect();
        format!("{cut}…")
    }
}
