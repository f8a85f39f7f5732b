//! CPU placement of queue workers

use std::io;
use std::mem;

/// Number of logical CPUs this process may run on.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pins the calling thread to `cpu`.
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }

    let ret = unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_count_positive() {
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn test_out_of_range_cpu_rejected() {
        let err = pin_current_thread(libc::CPU_SETSIZE as usize).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn test_pin_to_allowed_cpu() {
        // Runs on its own thread so the test harness thread keeps its mask.
        std::thread::spawn(|| {
            let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
            let ret = unsafe {
                libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set)
            };
            assert_eq!(ret, 0);
            let allowed = (0..libc::CPU_SETSIZE as usize)
                .find(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
                .unwrap();
            pin_current_thread(allowed).unwrap();
        })
        .join()
        .unwrap();
    }
}
