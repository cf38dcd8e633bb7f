//! プロセス制御機能

use crate::thread::{TargetThread, ThreadId};
use crate::Result;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs;

/// /proc/pid/task からネイティブスレッドIDの一覧を読む
pub fn list_threads(pid: i32) -> Result<Vec<ThreadId>> {
    let task_dir = format!("/proc/{}/task", pid);
    let mut tids = Vec::new();

    for entry in fs::read_dir(&task_dir)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", task_dir, e))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let tid: ThreadId = name
            .to_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("Unexpected entry in {}: {:?}", task_dir, name))?;
        tids.push(tid);
    }

    // 先頭はメインスレッド
    tids.sort_unstable();
    if let Some(pos) = tids.iter().position(|t| *t == pid) {
        tids.swap(0, pos);
    }
    Ok(tids)
}

/// 検査対象のプロセス
///
/// 全ネイティブスレッドへのアタッチを所有します。同じプロセスに対して
/// 同時に複数の TargetProcess を持つことはできません（2つ目のアタッチが
/// EPERM で失敗します）。Drop 時にデタッチします。
pub struct TargetProcess {
    pid: Pid,
    threads: Vec<TargetThread>,
}

impl TargetProcess {
    /// 既存のプロセスの全スレッドにアタッチして停止させる
    pub fn attach(pid: i32) -> Result<Self> {
        let tids = list_threads(pid)?;
        let mut threads = Vec::with_capacity(tids.len());

        for tid in tids {
            let tid = Pid::from_raw(tid);
            nix::sys::ptrace::attach(tid)
                .map_err(|e| anyhow::anyhow!("Failed to attach to thread {}: {}", tid, e))?;

            // アタッチ由来の SIGSTOP 停止を待つ
            match waitpid(tid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::Stopped(_, _) => {}
                status => {
                    return Err(anyhow::anyhow!(
                        "Unexpected wait status after attach to {}: {:?}",
                        tid,
                        status
                    ))
                }
            }
            threads.push(TargetThread::new(tid.as_raw()));
        }

        tracing::debug!(pid, nr_threads = threads.len(), "attached to target");
        Ok(Self {
            pid: Pid::from_raw(pid),
            threads,
        })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// メインスレッド（リーダー）を取得する
    pub fn leader(&self) -> &TargetThread {
        &self.threads[0]
    }

    /// 全スレッドを取得する
    pub fn threads(&self) -> &[TargetThread] {
        &self.threads
    }

    /// スレッド数を取得する
    pub fn nr_threads(&self) -> usize {
        self.threads.len()
    }

    /// 指定スレッドを検索する
    pub fn find_thread(&self, tid: ThreadId) -> Option<&TargetThread> {
        self.threads.iter().find(|t| t.tid() == tid)
    }

    /// 全スレッドからデタッチする
    pub fn detach(&mut self) -> Result<()> {
        for thread in self.threads.drain(..) {
            nix::sys::ptrace::detach(Pid::from_raw(thread.tid()), None)?;
        }
        Ok(())
    }
}

impl Drop for TargetProcess {
    fn drop(&mut self) {
        for thread in &self.threads {
            let _ = nix::sys::ptrace::detach(Pid::from_raw(thread.tid()), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_threads_self() {
        let pid = std::process::id() as i32;
        let tids = list_threads(pid).expect("list own threads");
        assert!(!tids.is_empty());
        // 先頭はメインスレッド
        assert_eq!(tids[0], pid);
    }
}
