//! Yadorigi CLI - コマンドラインインターフェース
//!
//! 実行中のプロセスにエージェントを注入し、内部状態を取得して
//! 表示するフロントエンドです。どのサブコマンドも終了時には
//! ターゲットを注入前の状態に戻します。

use std::io::Read as _;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use yadorigi_core::{AgentBlob, Session};
use yadorigi_proto::args::{PageVec, PAGE_SIZE};

/// Yadorigi - process state capture via code injection
#[derive(Parser)]
#[command(name = "yadorigi")]
#[command(version = "0.1.0")]
#[command(about = "Capture live process state by injecting a resident agent", long_about = None)]
struct Cli {
    /// 注入するエージェントイメージのパス
    #[arg(long, global = true, default_value = "yadorigi-agent.img")]
    agent: PathBuf,

    #[command(subcommand)]
    command: CaptureCommand,
}

#[derive(Subcommand)]
enum CaptureCommand {
    /// Capture per-process and per-thread state
    Capture {
        /// Process ID to inject into
        #[arg(short, long)]
        pid: i32,

        /// Also query terminal state of this descriptor
        #[arg(long)]
        tty: Option<i32>,
    },

    /// Transfer a page range out of the target
    Pages {
        /// Process ID to inject into
        #[arg(short, long)]
        pid: i32,

        /// Start address in the target (hex, page aligned)
        #[arg(long)]
        start: String,

        /// Length in bytes (page aligned)
        #[arg(long)]
        len: usize,

        /// Output file
        #[arg(long)]
        out: PathBuf,
    },

    /// Duplicate target descriptors into this process
    Fds {
        /// Process ID to inject into
        #[arg(short, long)]
        pid: i32,

        /// Descriptor numbers inside the target
        fds: Vec<i32>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let blob = AgentBlob::from_file(&cli.agent)
        .with_context(|| format!("loading agent image {}", cli.agent.display()))?;

    match cli.command {
        CaptureCommand::Capture { pid, tty } => capture(pid, &blob, tty),
        CaptureCommand::Pages {
            pid,
            start,
            len,
            out,
        } => pages(pid, &blob, &start, len, &out),
        CaptureCommand::Fds { pid, fds } => drain(pid, &blob, &fds),
    }
}

/// エージェントのログを自分の標準エラーへ向ける
fn wire_agent_log(session: &Session) -> Result<()> {
    let stderr = unsafe { BorrowedFd::borrow_raw(libc::STDERR_FILENO) };
    session.cfg_log(stderr, 4)
}

fn capture(pid: i32, blob: &AgentBlob, tty: Option<i32>) -> Result<()> {
    let session = Session::infect(pid, blob)?;
    wire_agent_log(&session)?;

    let misc = session.dump_misc()?;
    println!("Process {}:", misc.pid);
    println!("  sid:   {}", misc.sid);
    println!("  pgid:  {}", misc.pgid);
    println!("  umask: 0o{:03o}", misc.umask);
    println!("  brk:   0x{:x}", misc.brk);
    println!("  tls:   0x{:x}", misc.tls);

    let creds = session.dump_creds()?;
    println!("  secbits: 0x{:x}", creds.secbits);
    let groups: Vec<String> = creds.groups[..creds.ngroups as usize]
        .iter()
        .map(|g| g.to_string())
        .collect();
    println!("  groups:  [{}]", groups.join(", "));

    let timers = session.dump_itimers()?;
    for (name, t) in [
        ("real", &timers.real),
        ("virtual", &timers.virt),
        ("prof", &timers.prof),
    ] {
        if t.value_sec != 0 || t.value_usec != 0 {
            println!(
                "  itimer {}: {}.{:06}s (interval {}.{:06}s)",
                name, t.value_sec, t.value_usec, t.interval_sec, t.interval_usec
            );
        }
    }

    let sigacts = session.dump_sigacts()?;
    let handled = sigacts
        .sas
        .iter()
        .filter(|sa| sa.handler != 0 && sa.handler != libc::SIG_IGN as u64)
        .count();
    println!("  signal handlers installed: {}", handled);

    println!("Threads:");
    for tid in session.thread_ids() {
        let info = session.dump_thread(tid)?;
        println!(
            "  tid {} -> native {} (tid_addr 0x{:x}, tls 0x{:x})",
            tid, info.tid, info.tid_addr, info.tls
        );
    }

    if let Some(fd) = tty {
        let tty = session.dump_tty(fd)?;
        if tty.hangup != 0 {
            println!("Terminal fd {}: hung up (pair-less pty)", fd);
        } else {
            println!(
                "Terminal fd {}: sid {} pgrp {} pckt {} lock {} excl {}",
                fd, tty.sid, tty.pgrp, tty.st_pckt, tty.st_lock, tty.st_excl
            );
        }
    }

    session.cure()?;
    println!("Target restored");
    Ok(())
}

fn pages(pid: i32, blob: &AgentBlob, start: &str, len: usize, out: &std::path::Path) -> Result<()> {
    let start = u64::from_str_radix(start.trim_start_matches("0x"), 16)
        .with_context(|| format!("parsing start address '{}'", start))?;

    let session = Session::infect(pid, blob)?;

    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("creating transfer pipe");
    }
    let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    // vmsplice は非ブロッキングなので、転送量ぶんの容量を先に確保する
    unsafe {
        libc::fcntl(write_end.as_raw_fd(), libc::F_SETPIPE_SZ, len as libc::c_int);
    }

    let iovs = [PageVec {
        start,
        len: len as u64,
    }];
    session.dump_pages(&iovs, write_end.as_fd())?;
    drop(write_end);

    let mut data = Vec::with_capacity(len);
    let mut file = std::fs::File::from(read_end);
    file.read_to_end(&mut data).context("draining transfer pipe")?;
    if data.len() != len {
        anyhow::bail!("short page transfer: {}/{} bytes", data.len(), len);
    }
    std::fs::write(out, &data).with_context(|| format!("writing {}", out.display()))?;
    println!(
        "Wrote {} pages from 0x{:x} to {}",
        len / PAGE_SIZE,
        start,
        out.display()
    );

    session.cure()?;
    println!("Target restored");
    Ok(())
}

fn drain(pid: i32, blob: &AgentBlob, fds: &[i32]) -> Result<()> {
    if fds.is_empty() {
        anyhow::bail!("no descriptors requested");
    }

    let session = Session::infect(pid, blob)?;
    let received = session.drain_fds(fds)?;
    for (target_fd, local) in fds.iter().zip(&received) {
        let link = std::fs::read_link(format!("/proc/self/fd/{}", local.as_raw_fd()))
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "?".into());
        println!("target fd {} -> local fd {} ({})", target_fd, local.as_raw_fd(), link);
    }

    session.cure()?;
    println!("Target restored");
    Ok(())
}
