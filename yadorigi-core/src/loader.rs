//! エージェントイメージのローダ
//!
//! トランポリン経由でターゲットに共有の RWX 匿名領域を確保させ、
//! /proc/pid/map_files/ を通じて同じ領域をコントローラ側にも
//! マップします。以後コントローラは自分のエイリアス越しに、
//! 停止の有無にかかわらずエージェントのコードと引数領域を
//! 読み書きできます。
//!
//! 領域のレイアウトは先頭からコード、引数領域、スレッドごとの
//! シグナルフレーム予約つきプライベートスタックの順で、すべて
//! ページ境界に揃えます。

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;

use yadorigi_proto::args::{
    round_up, AGENT_STACK_SIZE, ARGS_SIZE_MIN, PAGE_SIZE, SIGFRAME_SIZE,
};
use yadorigi_proto::{AddrMap, LocalAddr, RemoteAddr};
use yadorigi_target::process::TargetProcess;

use crate::blob::AgentBlob;
use crate::error::InfectError;
use crate::trampoline::Trampoline;
use crate::Result;

/// イメージ内の各区画のオフセット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// 引数領域の先頭オフセット
    pub args_off: usize,
    /// 引数領域の長さ
    pub args_len: usize,
    /// スタック区画の先頭オフセット
    pub stacks_off: usize,
    /// スレッド1本ぶんのスタック区画（シグナルフレーム込み）
    pub per_thread: usize,
    /// 領域全体の長さ
    pub total: usize,
}

/// イメージのレイアウトを計算する
pub fn image_layout(code_len: usize, args_len: usize, nr_threads: usize) -> ImageLayout {
    let args_off = round_up(code_len, PAGE_SIZE);
    let args_len = round_up(args_len.max(ARGS_SIZE_MIN), PAGE_SIZE);
    let stacks_off = args_off + args_len;
    let per_thread = round_up(SIGFRAME_SIZE + AGENT_STACK_SIZE, PAGE_SIZE);
    ImageLayout {
        args_off,
        args_len,
        stacks_off,
        per_thread,
        total: stacks_off + nr_threads * per_thread,
    }
}

/// ロード済みのエージェントイメージ
///
/// リモート側のアンマップはターゲットのスレッドを借りないと
/// できないため、[`AgentImage::unload`] で明示的に行います。
/// Drop はローカルエイリアスだけを畳みます。
pub struct AgentImage {
    map: AddrMap,
    layout: ImageLayout,
    entry: RemoteAddr,
    local_unmapped: bool,
}

impl AgentImage {
    /// イメージをターゲットへロードする
    pub fn load(
        process: &TargetProcess,
        trampoline: &Trampoline,
        blob: &AgentBlob,
        args_len: usize,
        nr_threads: usize,
    ) -> Result<Self> {
        let layout = image_layout(blob.len(), args_len, nr_threads);

        // ターゲットに共有の匿名 RWX 領域を確保させる
        let ret = trampoline.syscall(
            process.leader(),
            libc::SYS_mmap,
            &[
                0,
                layout.total as u64,
                (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as u64,
                (libc::MAP_SHARED | libc::MAP_ANONYMOUS) as u64,
                u64::MAX, // fd = -1
                0,
            ],
        )?;
        if ret < 0 {
            return Err(InfectError::RemoteSyscall {
                name: "mmap",
                code: ret as i32,
            }
            .into());
        }
        let remote_base = RemoteAddr(ret as u64);

        // 同じ物理ページをこちら側にもマップする
        let path = format!(
            "/proc/{}/map_files/{:x}-{:x}",
            process.pid(),
            remote_base.0,
            remote_base.0 + layout.total as u64
        );
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("Failed to open alias {}: {}", path, e))?;
        let local = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                layout.total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if local == libc::MAP_FAILED {
            return Err(anyhow::anyhow!(
                "Failed to alias agent image locally: {}",
                std::io::Error::last_os_error()
            ));
        }

        let map = AddrMap::new(remote_base, LocalAddr(local as usize), layout.total);
        let image = Self {
            map,
            layout,
            entry: remote_base.add(blob.entry_offset() as usize),
            local_unmapped: false,
        };

        // コード本体はエイリアス越しに流し込む
        image.bytes()[..blob.len()].copy_from_slice(blob.code());

        tracing::debug!(
            pid = process.pid(),
            remote = %remote_base,
            len = layout.total,
            "agent image loaded"
        );
        Ok(image)
    }

    pub fn map(&self) -> AddrMap {
        self.map
    }

    pub fn entry(&self) -> RemoteAddr {
        self.entry
    }

    /// 引数領域の先頭（ターゲット空間）
    pub fn args_remote(&self) -> RemoteAddr {
        self.map.remote_base().add(self.layout.args_off)
    }

    /// スレッド `idx` 用のスタック最上部（ターゲット空間）
    ///
    /// 区画の下端はシグナルフレーム用の予約で、スタックは上端から
    /// 下へ伸びます。
    pub fn thread_stack(&self, idx: usize) -> RemoteAddr {
        self.map
            .remote_base()
            .add(self.layout.stacks_off + (idx + 1) * self.layout.per_thread)
    }

    #[allow(clippy::mut_from_ref)]
    fn bytes(&self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.map.local_base().0 as *mut u8, self.layout.total)
        }
    }

    /// 引数領域（コントローラ側エイリアス）
    #[allow(clippy::mut_from_ref)]
    pub fn args_bytes(&self) -> &mut [u8] {
        &mut self.bytes()[self.layout.args_off..self.layout.args_off + self.layout.args_len]
    }

    /// 両側のマッピングを畳む
    ///
    /// リモート側はターゲットのリーダーに munmap を実行させます。
    /// この時点でリーダーはトラップ停止していなければなりません。
    pub fn unload(&mut self, process: &TargetProcess, trampoline: &Trampoline) -> Result<()> {
        let ret = trampoline.syscall(
            process.leader(),
            libc::SYS_munmap,
            &[self.map.remote_base().0, self.layout.total as u64, 0, 0, 0, 0],
        )?;
        if ret != 0 {
            return Err(InfectError::RemoteSyscall {
                name: "munmap",
                code: ret as i32,
            }
            .into());
        }

        self.unmap_local();
        tracing::debug!(remote = %self.map.remote_base(), "agent image unloaded");
        Ok(())
    }

    fn unmap_local(&mut self) {
        if !self.local_unmapped {
            unsafe {
                libc::munmap(self.map.local_base().0 as *mut libc::c_void, self.layout.total);
            }
            self.local_unmapped = true;
        }
    }
}

impl Drop for AgentImage {
    fn drop(&mut self) {
        self.unmap_local();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_page_aligned() {
        let l = image_layout(5000, 100, 3);
        assert_eq!(l.args_off, 2 * PAGE_SIZE);
        assert_eq!(l.args_len, ARGS_SIZE_MIN);
        assert_eq!(l.args_off % PAGE_SIZE, 0);
        assert_eq!(l.stacks_off % PAGE_SIZE, 0);
        assert_eq!(l.per_thread % PAGE_SIZE, 0);
        assert_eq!(l.total, l.stacks_off + 3 * l.per_thread);
    }

    #[test]
    fn test_layout_args_rounding() {
        let l = image_layout(PAGE_SIZE, 3 * PAGE_SIZE + 1, 1);
        assert_eq!(l.args_off, PAGE_SIZE);
        assert_eq!(l.args_len, 4 * PAGE_SIZE);
    }

    #[test]
    fn test_layout_stack_fits() {
        let l = image_layout(0, 0, 1);
        assert!(l.per_thread >= SIGFRAME_SIZE + AGENT_STACK_SIZE);
    }
}
