//! Optional CPU-pinning diagnostic.
//!
//! When enabled, every subscribed thread is pinned to one shared,
//! lazily-chosen CPU, so the OS cannot run two subscribed threads in
//! parallel even outside control points. Unsubscribing restores the
//! process's original mask. Linux only; failures warn and the run
//! continues unpinned.

#[cfg(target_os = "linux")]
mod imp {
    use std::io;
    use std::sync::OnceLock;

    /// CPU all subscribed threads share, chosen on first pin.
    static PINNED_CPU: OnceLock<usize> = OnceLock::new();
    /// Affinity mask of the process before any pinning.
    static DEFAULT_MASK: OnceLock<libc::cpu_set_t> = OnceLock::new();

    fn current_mask() -> io::Result<libc::cpu_set_t> {
        // SAFETY: a zeroed cpu_set_t is valid; pid 0 is the calling
        // thread.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(set)
        }
    }

    fn apply(set: &libc::cpu_set_t) -> io::Result<()> {
        // SAFETY: the mask is valid for the duration of the call.
        let rc = unsafe {
            libc::pthread_setaffinity_np(
                libc::pthread_self(),
                std::mem::size_of::<libc::cpu_set_t>(),
                set,
            )
        };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    /// Pick one allowed CPU at random for the whole process.
    fn pick_cpu(allowed: &libc::cpu_set_t) -> usize {
        let capacity = std::mem::size_of::<libc::cpu_set_t>() * 8;
        let cpus: Vec<usize> = (0..capacity)
            // SAFETY: cpu is below the set capacity.
            .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, allowed) })
            .collect();
        if cpus.is_empty() {
            return 0;
        }
        cpus[rand::random::<usize>() % cpus.len()]
    }

    pub(super) fn pin_current() -> io::Result<()> {
        let default = *DEFAULT_MASK.get_or_init(|| {
            // An unreadable mask degrades to an empty one: apply fails
            // with EINVAL and the caller reports it.
            current_mask().unwrap_or_else(|_| unsafe { std::mem::zeroed() })
        });

        let cpu = *PINNED_CPU.get_or_init(|| pick_cpu(&default));
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        // SAFETY: cpu comes from pick_cpu and is below the set capacity.
        unsafe {
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
        }
        apply(&set)
    }

    pub(super) fn unpin_current() -> io::Result<()> {
        match DEFAULT_MASK.get() {
            Some(mask) => apply(mask),
            None => Ok(()),
        }
    }
}

/// Pin the calling thread to the shared diagnostic CPU.
pub(crate) fn pin_current() {
    #[cfg(target_os = "linux")]
    if let Err(err) = imp::pin_current() {
        log::warn!("failed to pin thread: {err}");
    }
    #[cfg(not(target_os = "linux"))]
    log::warn!("CPU pinning is not supported on this platform");
}

/// Restore the calling thread's original affinity mask.
pub(crate) fn unpin_current() {
    #[cfg(target_os = "linux")]
    if let Err(err) = imp::unpin_current() {
        log::warn!("failed to restore thread affinity: {err}");
    }
}
