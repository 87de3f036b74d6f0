//! vfsim command-line tool.
//!
//! Runs one filesystem operation against a persistent vfsim tree and exits.
//!
//! Usage:
//!   # First run seeds the standard hierarchy
//!   vfsim ls /
//!
//!   # Act as another user
//!   vfsim --user bob --uid 1001 --gid 1001 cat /home/alice/notes.txt
//!
//!   # Superuser
//!   vfsim --root chown 1001:1001 /srv/shared
//!
//! Logs go to stderr; set `RUST_LOG=vfsim_kernel=debug` for detail.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use vfsim_kernel::vfs::{FileAttr, path};
use vfsim_kernel::{FileType, Identity, Permissions, RequestContext, VfsConfig, VirtualFileSystem};

/// Operate on a vfsim virtual filesystem.
#[derive(Parser, Debug)]
#[command(name = "vfsim")]
#[command(about = "Operate on a vfsim virtual filesystem")]
struct Args {
    /// RON config file (defaults to the XDG config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database, overriding the config
    #[arg(long)]
    db: Option<PathBuf>,

    /// Act as the superuser
    #[arg(long, conflicts_with_all = ["user", "uid", "gid"])]
    root: bool,

    /// User name (defaults to the configured user)
    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    uid: Option<u32>,

    #[arg(long)]
    gid: Option<u32>,

    /// Working directory for relative paths (defaults to the user's home)
    #[arg(long)]
    cwd: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open (seeding on first run) and report what was loaded
    Init,
    /// List a directory
    Ls {
        #[arg(default_value = ".")]
        path: String,
        /// Long format
        #[arg(short, long)]
        long: bool,
    },
    /// Print a file
    Cat { path: String },
    /// Replace a file's content (reads stdin when no text is given)
    Write { path: String, text: Option<String> },
    /// Create an empty file
    Touch { path: String },
    /// Create a directory
    Mkdir {
        path: String,
        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },
    /// Remove a file or directory
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Move or rename
    Mv { src: String, dst: String },
    /// Copy, recursively for directories
    Cp { src: String, dst: String },
    /// Create a symbolic link
    Ln { target: String, link: String },
    /// Print a symlink's target
    Readlink { path: String },
    /// Show metadata
    Stat {
        path: String,
        /// Describe a symlink itself rather than its target
        #[arg(long)]
        no_follow: bool,
    },
    /// Change mode bits (octal such as 640, or rwxr-x---)
    Chmod { mode: String, path: String },
    /// Change owner, as UID:GID
    Chown { owner: String, path: String },
    /// List mount points
    Mounts,
    /// Show recent audit entries from the audit log
    Audit {
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
    /// Check content integrity
    Fsck,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("vfsim").join("config.ron"))
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vfsim")
        .join("fs.db")
}

fn load_config(args: &Args) -> Result<VfsConfig> {
    let mut config = match args.config.clone().or_else(default_config_path) {
        Some(path) if path.exists() => {
            VfsConfig::load(&path).with_context(|| format!("loading {}", path.display()))?
        }
        _ => {
            let mut config = VfsConfig::default();
            config.default_user.name = whoami::username();
            config
        }
    };
    if let Some(db) = &args.db {
        config.database_path = Some(db.clone());
    }
    if config.database_path.is_none() {
        config.database_path = Some(default_db_path());
    }
    if let Some(path) = config.resolved_database_path() {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
    }
    Ok(config)
}

fn request_context(args: &Args, config: &VfsConfig) -> RequestContext {
    let ctx = if args.root {
        RequestContext::root()
    } else {
        let user = &config.default_user;
        RequestContext::new(Identity::new(
            args.user.clone().unwrap_or_else(|| user.name.clone()),
            args.uid.unwrap_or(user.uid),
            args.gid.unwrap_or(user.gid),
        ))
    };
    match &args.cwd {
        Some(cwd) => ctx.with_cwd(cwd),
        None => ctx,
    }
}

fn type_char(kind: FileType) -> char {
    match kind {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::File => '-',
    }
}

fn long_line(attr: &FileAttr) -> String {
    let mut line = format!(
        "{}{} {:>5}:{:<5} {:>8} {} {}",
        type_char(attr.kind),
        attr.permissions,
        attr.owner_id,
        attr.group_id,
        attr.size,
        attr.modified_at.format("%Y-%m-%d %H:%M"),
        attr.name
    );
    if let Some(target) = &attr.symlink_target {
        line.push_str(" -> ");
        line.push_str(target);
    }
    line
}

fn parse_mode(mode: &str) -> Result<Permissions> {
    let parsed = if mode.len() == 9 && !mode.chars().all(|c| c.is_ascii_digit()) {
        Permissions::from_rwx(mode)
    } else {
        Permissions::from_octal(mode)
    };
    Ok(parsed?)
}

fn parse_owner(owner: &str) -> Result<(u32, u32)> {
    let Some((uid, gid)) = owner.split_once(':') else {
        bail!("expected UID:GID, got {owner}");
    };
    Ok((uid.parse().context("bad uid")?, gid.parse().context("bad gid")?))
}

async fn run(vfs: &VirtualFileSystem, ctx: &RequestContext, command: Command) -> Result<()> {
    match command {
        Command::Init => match vfs.load_report() {
            Some(report) => println!(
                "loaded generation {} ({} nodes, {} corrupted)",
                report.generation,
                report.nodes,
                report.corrupted.len()
            ),
            None => println!("seeded new filesystem ({} nodes)", vfs.verify().nodes),
        },
        Command::Ls { path, long } => {
            let base = ctx.resolve(&path)?;
            for entry in vfs.list_directory(ctx, &base).await? {
                if long {
                    let child = path::join(&base, &entry.name);
                    println!("{}", long_line(&vfs.symlink_metadata(ctx, &child).await?));
                } else if entry.kind == FileType::Directory {
                    println!("{}/", entry.name);
                } else {
                    println!("{}", entry.name);
                }
            }
        }
        Command::Cat { path } => {
            let data = vfs.read_file(ctx, &path).await?;
            print!("{}", String::from_utf8_lossy(&data));
        }
        Command::Write { path, text } => {
            let data = match text {
                Some(text) => text.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let attr = vfs.write_file(ctx, &path, &data).await?;
            tracing::info!(path = %attr.path, bytes = attr.size, "written");
        }
        Command::Touch { path } => {
            if !vfs.exists(ctx, &path).await? {
                vfs.create_file(ctx, &path, None).await?;
            }
        }
        Command::Mkdir { path, parents } => {
            if parents {
                vfs.create_dir_all(ctx, &path).await?;
            } else {
                vfs.create_directory(ctx, &path).await?;
            }
        }
        Command::Rm { path, recursive } => vfs.delete(ctx, &path, recursive).await?,
        Command::Mv { src, dst } => {
            let attr = vfs.move_path(ctx, &src, &dst).await?;
            println!("{}", attr.path);
        }
        Command::Cp { src, dst } => {
            let attr = vfs.copy_path(ctx, &src, &dst).await?;
            println!("{}", attr.path);
        }
        Command::Ln { target, link } => {
            vfs.create_symlink(ctx, &link, &target).await?;
        }
        Command::Readlink { path } => println!("{}", vfs.read_link(ctx, &path).await?),
        Command::Stat { path, no_follow } => {
            let attr = if no_follow {
                vfs.symlink_metadata(ctx, &path).await?
            } else {
                vfs.get_node(ctx, &path).await?
            };
            println!("  Path: {}", attr.path);
            println!("  Type: {:?}", attr.kind);
            println!("  Size: {}", attr.size);
            println!("  Mode: {} ({})", attr.permissions.to_octal(), attr.permissions);
            println!(" Owner: {}:{}", attr.owner_id, attr.group_id);
            if let Some(mime) = &attr.mime_type {
                println!("  MIME: {mime}");
            }
            if let Some(target) = &attr.symlink_target {
                println!("Target: {target}");
            }
            println!("Access: {}", attr.accessed_at.to_rfc3339());
            println!("Modify: {}", attr.modified_at.to_rfc3339());
            println!(" Birth: {}", attr.created_at.to_rfc3339());
        }
        Command::Chmod { mode, path } => {
            vfs.chmod(ctx, &path, parse_mode(&mode)?).await?;
        }
        Command::Chown { owner, path } => {
            let (uid, gid) = parse_owner(&owner)?;
            vfs.chown(ctx, &path, uid, gid).await?;
        }
        Command::Mounts => {
            for mp in vfs.list_mounts() {
                println!("{} on {} ({})", mp.fs_type, mp.mount_path, mp.options);
            }
        }
        Command::Audit { lines } => {
            let log = vfs.read_file(ctx, vfs.audit_log_path()).await?;
            let text = String::from_utf8_lossy(&log);
            let all: Vec<&str> = text.lines().collect();
            for line in &all[all.len().saturating_sub(lines)..] {
                println!("{line}");
            }
        }
        Command::Fsck => {
            let report = vfs.verify();
            println!(
                "{} nodes: {} files, {} directories, {} symlinks, {} bytes",
                report.nodes, report.files, report.directories, report.symlinks, report.bytes
            );
            if !report.is_clean() {
                for path in &report.corrupted {
                    println!("CORRUPT {path}");
                }
                bail!("{} corrupted files", report.corrupted.len());
            }
            println!("clean");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let ctx = request_context(&args, &config);
    tracing::debug!(
        user = %ctx.identity.username,
        uid = ctx.identity.user_id,
        db = ?config.database_path,
        "opening"
    );

    let vfs = VirtualFileSystem::open(config).await?;
    if let Some(report) = vfs.load_report() {
        if !report.corrupted.is_empty() {
            tracing::warn!(
                files = report.corrupted.len(),
                "corrupted content detected, run `vfsim fsck`"
            );
        }
    }

    run(&vfs, &ctx, args.command).await
}
