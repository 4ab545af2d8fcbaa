use nix::unistd::geteuid;

use crate::loader::LoaderError;

/// Loading probes requires an effective uid of root.
pub fn is_privileged() -> bool {
    geteuid().is_root()
}

/// Bumps the rlimit for memlock up to full capacity.
/// This is required to load even reasonably sized eBPF maps until kernel 5.11.
pub fn bump_memlock_rlimit() -> Result<(), LoaderError> {
    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        return Err(LoaderError::Rlimit(std::io::Error::last_os_error()));
    }
    Ok(())
}
