//! Syscall classification policy
//!
//! Deny-list policy: syscalls that can diverge control flow or terminate
//! the thread/process may not be handled directly, and they are infrequent
//! enough that the slow path costs nothing. Everything else defaults to the
//! fast path.

use dcall_api::nr::*;

/// Where a syscall is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Path {
    /// Direct call into the fast-entry routine.
    Fast,
    /// The retained generic dispatcher.
    Slow,
}

/// The divergent/terminal syscalls that always take the slow path.
pub const DIVERGENT_SYSCALLS: [u32; 8] = [
    SYS_CLONE,
    SYS_CLONE3,
    SYS_FORK,
    SYS_VFORK,
    SYS_EXECVE,
    SYS_EXECVEAT,
    SYS_EXIT,
    SYS_EXIT_GROUP,
];

/// Classifies syscall number `nr`.
pub fn classify(nr: u32) -> Path {
    if matches!(
        nr,
        SYS_CLONE
            | SYS_CLONE3
            | SYS_FORK
            | SYS_VFORK
            | SYS_EXECVE
            | SYS_EXECVEAT
            | SYS_EXIT
            | SYS_EXIT_GROUP
    ) {
        Path::Slow
    } else {
        Path::Fast
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divergent_set_is_slow() {
        for nr in DIVERGENT_SYSCALLS {
            assert_eq!(classify(nr), Path::Slow, "syscall {} must be slow", nr);
        }
    }

    #[test]
    fn common_calls_are_fast() {
        for nr in [SYS_READ, SYS_WRITE, SYS_CLOSE, SYS_MMAP, SYS_GETPID] {
            assert_eq!(classify(nr), Path::Fast, "syscall {} must be fast", nr);
        }
    }
}
