//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};

/// メモリマッピング情報
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub path: Option<String>,
}

impl MemoryMapping {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// ターゲットプロセスのメモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    pub fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr as u64))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)
            .map_err(|e| anyhow::anyhow!("Failed to read {} bytes at 0x{:x}: {}", size, addr, e))?;

        Ok(buffer)
    }

    /// メモリにデータを書き込む
    pub fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        let mem_path = self.mem_path();
        let mut file = OpenOptions::new()
            .write(true)
            .open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {} for writing: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr as u64))
            .map_err(|e| anyhow::anyhow!("Failed to seek to address 0x{:x}: {}", addr, e))?;

        file.write_all(data)
            .map_err(|e| anyhow::anyhow!("Failed to write {} bytes to 0x{:x}: {}", data.len(), addr, e))?;

        Ok(())
    }

    /// PTRACE_PEEKDATA でワード単位に読み取る
    ///
    /// コード領域のガジェット退避に使います。サイズはワード境界に
    /// 揃っていなければなりません。
    pub fn peek_area(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let word = std::mem::size_of::<libc::c_long>();
        if buf.len() % word != 0 {
            return Err(anyhow::anyhow!("Peek request with non-word size {}", buf.len()));
        }

        for (i, chunk) in buf.chunks_mut(word).enumerate() {
            // PEEKDATA は戻り値がデータなので errno を先にクリアする
            unsafe { *libc::__errno_location() = 0 };
            let val = unsafe {
                libc::ptrace(
                    libc::PTRACE_PEEKDATA,
                    self.pid.as_raw(),
                    addr + i * word,
                    0,
                )
            };
            let errno = unsafe { *libc::__errno_location() };
            if errno != 0 {
                return Err(anyhow::anyhow!(
                    "PTRACE_PEEKDATA at 0x{:x} failed: {}",
                    addr + i * word,
                    std::io::Error::from_raw_os_error(errno)
                ));
            }
            chunk.copy_from_slice(&val.to_ne_bytes());
        }
        Ok(())
    }

    /// PTRACE_POKEDATA でワード単位に書き込む
    ///
    /// /proc/pid/mem と違い、読み取り専用のコードページにも
    /// 書き込めます（FOLL_FORCE 相当）。
    pub fn poke_area(&self, addr: usize, data: &[u8]) -> Result<()> {
        let word = std::mem::size_of::<libc::c_long>();
        if data.len() % word != 0 {
            return Err(anyhow::anyhow!("Poke request with non-word size {}", data.len()));
        }

        for (i, chunk) in data.chunks(word).enumerate() {
            let val = libc::c_long::from_ne_bytes(chunk.try_into().unwrap());
            let ret = unsafe {
                libc::ptrace(
                    libc::PTRACE_POKEDATA,
                    self.pid.as_raw(),
                    addr + i * word,
                    val,
                )
            };
            if ret != 0 {
                return Err(anyhow::anyhow!(
                    "PTRACE_POKEDATA at 0x{:x} failed: {}",
                    addr + i * word,
                    std::io::Error::last_os_error()
                ));
            }
        }
        Ok(())
    }

    /// 領域の内容を入れ替える（元の内容を返す）
    pub fn swap_area(&self, addr: usize, new: &[u8]) -> Result<Vec<u8>> {
        let mut orig = vec![0u8; new.len()];
        self.peek_area(addr, &mut orig)?;
        self.poke_area(addr, new)?;
        Ok(orig)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();

        for line in reader.lines() {
            let line = line?;
            // フォーマット: "address perms offset dev inode pathname"
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 2 {
                continue;
            }

            let addr_parts: Vec<&str> = parts[0].split('-').collect();
            if addr_parts.len() != 2 {
                continue;
            }

            let start = usize::from_str_radix(addr_parts[0], 16)
                .map_err(|e| anyhow::anyhow!("Failed to parse start address: {}", e))?;
            let end = usize::from_str_radix(addr_parts[1], 16)
                .map_err(|e| anyhow::anyhow!("Failed to parse end address: {}", e))?;

            let perms = parts[1];
            let readable = perms.starts_with('r');
            let writable = perms.chars().nth(1) == Some('w');
            let executable = perms.chars().nth(2) == Some('x');

            let path = if parts.len() >= 6 {
                Some(parts[5..].join(" "))
            } else {
                None
            };

            mappings.push(MemoryMapping {
                start,
                end,
                readable,
                writable,
                executable,
                path,
            });
        }

        Ok(mappings)
    }
}

/// ガジェットを置ける実行可能マッピングを探す
///
/// ユーザ空間の実行可能領域で、先頭に `code_len` バイトの
/// ガジェットが収まるものを選びます。
pub fn find_executable_vma(mappings: &[MemoryMapping], code_len: usize) -> Option<&MemoryMapping> {
    // x86_64 のユーザ空間上限
    const TASK_SIZE: usize = 0x7fff_ffff_f000;

    mappings
        .iter()
        .filter(|m| m.start < TASK_SIZE)
        .filter(|m| m.executable)
        .find(|m| m.len() >= code_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_mappings_self() {
        let memory = Memory::new(std::process::id() as i32);
        let mappings = memory.get_mappings().expect("read own maps");

        assert!(!mappings.is_empty());
        // 少なくとも1つは実行可能領域がある
        assert!(mappings.iter().any(|m| m.executable));
    }

    #[test]
    fn test_find_executable_vma_self() {
        let memory = Memory::new(std::process::id() as i32);
        let mappings = memory.get_mappings().expect("read own maps");

        let vma = find_executable_vma(&mappings, 8).expect("find executable vma");
        assert!(vma.executable);
        assert!(vma.len() >= 8);
    }

    #[test]
    fn test_find_executable_vma_none() {
        let mappings = vec![MemoryMapping {
            start: 0x1000,
            end: 0x2000,
            readable: true,
            writable: true,
            executable: false,
            path: None,
        }];
        assert!(find_executable_vma(&mappings, 8).is_none());
    }

    #[test]
    fn test_read_self_memory() {
        let memory = Memory::new(std::process::id() as i32);
        let data = [0xabu8; 32];
        let addr = data.as_ptr() as usize;

        let read = memory.read(addr, data.len()).expect("read own memory");
        assert_eq!(read, data);
    }
}
