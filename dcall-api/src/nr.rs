//! Syscall number table
//!
//! Ordinary numbers follow the x86-64 convention; the two bridge calls sit
//! past the end of the regular table.

/// System call numbers
pub const SYS_READ: u32 = 0;
pub const SYS_WRITE: u32 = 1;
pub const SYS_CLOSE: u32 = 3;
pub const SYS_MMAP: u32 = 9;
pub const SYS_MUNMAP: u32 = 11;
pub const SYS_GETPID: u32 = 39;
pub const SYS_CLONE: u32 = 56;
pub const SYS_FORK: u32 = 57;
pub const SYS_VFORK: u32 = 58;
pub const SYS_EXECVE: u32 = 59;
pub const SYS_EXIT: u32 = 60;
pub const SYS_EXIT_GROUP: u32 = 231;
pub const SYS_EXECVEAT: u32 = 322;
pub const SYS_CLONE3: u32 = 435;

// Bridge system calls
/// Register the calling thread's control page address and trigger the first
/// remap.
pub const SYS_REGISTER_CONTROL_PAGE: u32 = 457;
/// Query the fast-entry address for the guest interception shim.
pub const SYS_DIRECT_ENTRY: u32 = 458;

/// Number of raw syscall arguments carried per call (`a1` is the number).
pub const SYSCALL_ARGS: usize = 7;

/// Raw argument frame: `a1` (the syscall number) through `a7`.
pub type SyscallArgs = [usize; SYSCALL_ARGS];
