//! POSIX shared-memory segment management.
//!
//! Thin, safe-ish wrapper around `shm_open`/`ftruncate`/`mmap`/`munmap`. The
//! segment is never resized after creation: the mapping length is fixed for
//! the lifetime of the `Segment`.

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::error::PoolError;

/// A mapped POSIX shared-memory segment.
///
/// Unmaps on drop. Does not unlink the underlying shared-memory object;
/// that is [`crate::pool::cleanup`]'s job.
pub struct Segment {
    base_addr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapped bytes are shared across processes and every mutation
// through them goes through the control mutex or the caller's own payload
// discipline; `Segment` itself holds no thread-confined state.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new segment with a freshly generated name, sized exactly `size` bytes.
    pub fn create(size: usize) -> Result<Self, PoolError> {
        let name = generate_segment_name();
        let c_name = CString::new(name.as_str()).expect("generated name has no interior NUL");

        // SAFETY: c_name is NUL-terminated; shm_unlink of a name that doesn't
        // exist is harmless and its result is discarded.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(PoolError::Io(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid, just-opened shared-memory descriptor.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            let _ = unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(PoolError::Io(err));
        }

        let base_addr = map(fd, size)?;
        // SAFETY: fd stays valid for close; the mapping retains its own reference.
        unsafe { libc::close(fd) };

        // SAFETY: base_addr is a fresh mapping of `size` writable bytes.
        unsafe { ptr::write_bytes(base_addr, 0, size) };

        Ok(Self { base_addr, size, name })
    }

    /// Open an existing segment by name, mapping its full current size.
    pub fn open(name: &str) -> Result<Self, PoolError> {
        let c_name = CString::new(name).expect("link file contents had no interior NUL");

        // SAFETY: c_name is NUL-terminated.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(PoolError::NotFound);
            }
            return Err(PoolError::Io(err));
        }

        let size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(PoolError::Io(err));
            }
            stat.st_size as usize
        };

        let base_addr = match map(fd, size) {
            Ok(addr) => addr,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        // SAFETY: fd stays valid for close; the mapping retains its own reference.
        unsafe { libc::close(fd) };

        Ok(Self {
            base_addr,
            size,
            name: name.to_string(),
        })
    }

    /// Remove the POSIX shared-memory object with this name. Idempotent:
    /// a missing object is success.
    pub fn unlink_by_name(name: &str) -> Result<(), PoolError> {
        let c_name = CString::new(name).map_err(|_| PoolError::Corrupt("link contents contain NUL"))?;
        // SAFETY: c_name is NUL-terminated; unlinking a nonexistent object
        // only sets errno, it does not corrupt anything.
        let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(PoolError::Io(err));
            }
        }
        Ok(())
    }

    /// Whether a segment with this name currently exists.
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is NUL-terminated; a read-only probe open.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn base_addr(&self) -> *mut u8 {
        self.base_addr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: base_addr/size came from a successful mmap in create()/open()
        // and this is the only place that unmaps them.
        unsafe {
            libc::munmap(self.base_addr as *mut libc::c_void, self.size);
        }
    }
}

fn map(fd: i32, size: usize) -> Result<*mut u8, PoolError> {
    // SAFETY: fd is a valid shared-memory descriptor sized at least `size`;
    // letting the kernel pick the address is always valid.
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(PoolError::Io(io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

/// Generate a segment name unique to this process and call site.
///
/// Uses pid + a process-local counter + wall-clock nanos rather than a
/// random UUID, so the crate carries no extra dependency for it.
fn generate_segment_name() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/shm-object-pool-{}-{}-{:x}", std::process::id(), seq, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_and_unlink_roundtrip() {
        let seg1 = Segment::create(4096).expect("create");
        assert_eq!(seg1.size(), 4096);
        assert!(Segment::exists(seg1.name()));

        unsafe {
            *seg1.base_addr() = 0x42;
            *seg1.base_addr().add(1) = 0x43;
        }

        let seg2 = Segment::open(seg1.name()).expect("open");
        unsafe {
            assert_eq!(*seg2.base_addr(), 0x42);
            assert_eq!(*seg2.base_addr().add(1), 0x43);
        }

        let name = seg1.name().to_string();
        drop(seg1);
        drop(seg2);
        Segment::unlink_by_name(&name).unwrap();
        assert!(!Segment::exists(&name));
    }

    #[test]
    fn open_nonexistent_is_not_found() {
        let result = Segment::open("/shm-object-pool-definitely-nonexistent-12345");
        assert!(matches!(result, Err(PoolError::NotFound)));
    }

    #[test]
    fn unlink_is_idempotent() {
        let seg = Segment::create(4096).unwrap();
        let name = seg.name().to_string();
        drop(seg);
        assert!(Segment::unlink_by_name(&name).is_ok());
        assert!(Segment::unlink_by_name(&name).is_ok());
    }
}
