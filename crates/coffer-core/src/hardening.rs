//! Process hardening at core construction.
//!
//! A secret store must keep key material off disk: pages holding the
//! keyring or unseal shares may not be swapped out, and a crash may not
//! leave a core file full of plaintext. [`harden`] applies both measures
//! in one shot and reports what actually took effect — neither is
//! guaranteed, since pinning memory needs `CAP_IPC_LOCK` on Linux and
//! non-Unix targets offer nothing to hook. Zeroization of key buffers
//! happens regardless of this outcome.

use tracing::warn;

/// What [`harden`] managed to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hardening {
    /// All current and future pages are pinned in RAM.
    pub memory_locked: bool,
    /// The kernel will not write core files for this process.
    pub core_dumps_disabled: bool,
}

/// Pin process memory and suppress core dumps, best-effort.
///
/// Failures are logged with their errno and reflected in the returned
/// [`Hardening`]; the caller decides whether an unhardened process is
/// acceptable.
#[must_use]
pub fn harden() -> Hardening {
    Hardening {
        memory_locked: pin_memory(),
        core_dumps_disabled: suppress_core_dumps(),
    }
}

#[cfg(unix)]
fn pin_memory() -> bool {
    // SAFETY: `mlockall` takes two flag bits and touches no memory owned
    // by this program; the kernel either pins the address space or
    // reports failure through the return value.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        warn!(
            errno = %std::io::Error::last_os_error(),
            "mlockall refused, key material may reach swap"
        );
    }
    rc == 0
}

#[cfg(not(unix))]
fn pin_memory() -> bool {
    warn!("memory pinning is not available on this platform");
    false
}

#[cfg(unix)]
fn suppress_core_dumps() -> bool {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `setrlimit` reads the struct passed on our stack and only
    // adjusts a per-process kernel limit.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if rc != 0 {
        warn!(
            errno = %std::io::Error::last_os_error(),
            "could not zero RLIMIT_CORE, crash dumps may contain keys"
        );
    }
    rc == 0
}

#[cfg(not(unix))]
fn suppress_core_dumps() -> bool {
    false
}
