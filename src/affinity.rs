//!
//! CPU pinning for the writer and completion threads, mirroring the source's
//! `pthread_setaffinity_np` call in the write thread startup path.
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::error::ZtlError;

pub fn pin_current_thread(core: usize) -> Result<(), ZtlError> {
    let mut set = CpuSet::new();
    set.set(core).map_err(|e| ZtlError::AsynchErr {
        reason: format!("invalid core {core}: {e}"),
    })?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}
