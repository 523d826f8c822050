//! Execution-context helpers: pin a worker thread to its lcore and raise its scheduling class.
//!
//! Both calls are best effort. Pinning or real-time scheduling can be refused (containers,
//! missing `CAP_SYS_NICE`, fewer online cores than requested); the worker then keeps running
//! unpinned and the failure is logged at debug level.

use tracing::debug;

/// Pin the calling thread to `lcore`. Returns whether the kernel accepted the mask.
///
/// Linux only; other platforms report `false` and leave scheduling to the OS.
pub fn set_thread_core(lcore: usize) -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_SETSIZE, CPU_ZERO};

        if lcore >= CPU_SETSIZE as usize {
            debug!(lcore, "lcore beyond cpu set size, not pinning");
            return false;
        }
        let rc = unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(lcore, &mut set);
            pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set)
        };
        if rc != 0 {
            debug!(lcore, rc, "thread pinning refused");
        }
        rc == 0
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!(lcore, "thread pinning unsupported on this platform");
        false
    }
}

/// Map a coarse priority level onto a scheduling policy for the calling thread.
///
/// - `>= 3`: `SCHED_FIFO` 90
/// - `2`: `SCHED_FIFO` 70
/// - `1`: `SCHED_RR` 30
/// - `0` or less: `SCHED_OTHER`
///
/// Returns whether the policy was applied.
pub fn set_thread_priority(priority: i32) -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_OTHER, SCHED_RR};

        let (policy, sched_priority) = match priority {
            p if p >= 3 => (SCHED_FIFO, 90),
            2 => (SCHED_FIFO, 70),
            1 => (SCHED_RR, 30),
            _ => (SCHED_OTHER, 0),
        };
        let rc = unsafe {
            let mut param: sched_param = std::mem::zeroed();
            param.sched_priority = sched_priority;
            pthread_setschedparam(pthread_self(), policy, &param)
        };
        if rc != 0 {
            debug!(priority, rc, "scheduling policy refused");
        }
        rc == 0
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = priority;
        false
    }
}
