/// Seccomp-BPF filter programs
///
/// A filter program is a sequence of fixed-size `sock_filter` instructions. On disk
/// it is stored as raw native-endian records, exactly the layout the kernel reads,
/// so a program compiled on the host can be loaded back without translation.
use crate::types::{JailError, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Kernel limit on the number of instructions in one program (BPF_MAXINSNS)
pub const MAX_FILTER_INSTRUCTIONS: usize = 4096;

/// Size of one encoded instruction
pub const FILTER_INSTRUCTION_SIZE: usize = std::mem::size_of::<FilterInstruction>();

// BPF opcodes
pub const BPF_LD: u16 = 0x00;
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_K: u16 = 0x00;
pub const BPF_RET: u16 = 0x06;

// Seccomp return actions
pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
const SECCOMP_FILTER_FLAG_LOG: libc::c_ulong = 1 << 1;

/// One classic BPF instruction, layout-compatible with `struct sock_filter`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FilterInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(FILTER_INSTRUCTION_SIZE == std::mem::size_of::<libc::sock_filter>());

impl FilterInstruction {
    /// BPF_STMT
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    /// BPF_JUMP
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.code.to_ne_bytes());
        out.push(self.jt);
        out.push(self.jf);
        out.extend_from_slice(&self.k.to_ne_bytes());
    }

    fn decode(record: &[u8]) -> Self {
        Self {
            code: u16::from_ne_bytes([record[0], record[1]]),
            jt: record[2],
            jf: record[3],
            k: u32::from_ne_bytes([record[4], record[5], record[6], record[7]]),
        }
    }
}

/// A complete seccomp filter program
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterProgram {
    instructions: Vec<FilterInstruction>,
}

impl FilterProgram {
    /// Wrap a list of instructions, rejecting programs the kernel would refuse
    pub fn new(instructions: Vec<FilterInstruction>) -> Result<Self> {
        if instructions.is_empty() {
            return Err(JailError::Config("Empty seccomp filter program".to_string()));
        }
        if instructions.len() > MAX_FILTER_INSTRUCTIONS {
            return Err(JailError::Config(format!(
                "Seccomp filter has {} instructions, limit is {}",
                instructions.len(),
                MAX_FILTER_INSTRUCTIONS
            )));
        }
        Ok(Self { instructions })
    }

    /// Load a compiled program from a file of raw instruction records
    ///
    /// The file size must be a positive multiple of the instruction size. The
    /// whole file is read before decoding; the read buffer is dropped on every path.
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();

        if size == 0 || size % FILTER_INSTRUCTION_SIZE as u64 != 0 {
            return Err(JailError::MalformedFilter {
                path: path.to_path_buf(),
                reason: format!(
                    "size {} is not a positive multiple of {}",
                    size, FILTER_INSTRUCTION_SIZE
                ),
            });
        }

        let mut data = Vec::with_capacity(size as usize);
        file.read_to_end(&mut data)?;

        // The file may have changed between stat and read
        if data.len() as u64 != size {
            return Err(JailError::MalformedFilter {
                path: path.to_path_buf(),
                reason: format!("short read: expected {} bytes, got {}", size, data.len()),
            });
        }

        let count = data.len() / FILTER_INSTRUCTION_SIZE;
        if count > MAX_FILTER_INSTRUCTIONS {
            return Err(JailError::MalformedFilter {
                path: path.to_path_buf(),
                reason: format!(
                    "{} instructions exceeds the limit of {}",
                    count, MAX_FILTER_INSTRUCTIONS
                ),
            });
        }

        let program = Self::from_bytes(&data).map_err(|e| JailError::MalformedFilter {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        log::debug!(
            "Loaded seccomp filter {} ({} instructions)",
            path.display(),
            program.len()
        );
        Ok(program)
    }

    /// Decode raw instruction records
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.is_empty() || data.len() % FILTER_INSTRUCTION_SIZE != 0 {
            return Err(JailError::Config(format!(
                "filter length {} is not a positive multiple of {}",
                data.len(),
                FILTER_INSTRUCTION_SIZE
            )));
        }
        let instructions = data
            .chunks_exact(FILTER_INSTRUCTION_SIZE)
            .map(FilterInstruction::decode)
            .collect();
        Self::new(instructions)
    }

    /// Encode as raw instruction records
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.instructions.len() * FILTER_INSTRUCTION_SIZE);
        for insn in &self.instructions {
            insn.encode(&mut out);
        }
        out
    }

    /// Write the program in the format `load` reads
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(&self.to_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn instructions(&self) -> &[FilterInstruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Install the program into the calling thread with `seccomp(2)`
    ///
    /// Only performs raw syscalls, so it is safe to call between fork and exit.
    /// Requires no-new-privs (or CAP_SYS_ADMIN).
    pub fn install(&self, log_failures: bool) -> std::io::Result<()> {
        let len = u16::try_from(self.instructions.len())
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        let prog = libc::sock_fprog {
            len,
            // The kernel only reads through this pointer
            filter: self.instructions.as_ptr() as *mut libc::sock_filter,
        };
        let flags: libc::c_ulong = if log_failures { SECCOMP_FILTER_FLAG_LOG } else { 0 };

        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                flags,
                &prog as *const libc::sock_fprog,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// Set PR_SET_NO_NEW_PRIVS on the calling thread
pub fn set_no_new_privs() -> std::io::Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Check whether the kernel exposes seccomp filtering
pub fn is_seccomp_supported() -> bool {
    std::fs::read_to_string("/proc/sys/kernel/seccomp/actions_avail")
        .map(|actions| actions.contains("kill_process") || actions.contains("kill"))
        .unwrap_or(false)
}
