//! GC Runtime - C FFI wrapper for SGC
//!
//! Every function reports failure through its return value (`false` or
//! null) and logs the cause; none of them unwinds across the boundary.

use sgc::{GcConfig, Runtime};
use std::ffi::{c_char, c_void, CStr};
use std::sync::OnceLock;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> Option<&'static Runtime> {
    let runtime = RUNTIME.get();
    if runtime.is_none() {
        log::error!("sgc: runtime used before sgc_initialize_heap");
    }
    runtime
}

fn report(what: &str, result: sgc::Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::error!("sgc: {} failed: {}", what, e);
            false
        },
    }
}

/// Reserve the heap and start the collector
///
/// Sizes of 0 keep the value from the environment (`SGC_MIN_HEAP`,
/// `SGC_MAX_HEAP`) or the default. Returns `true` if the runtime is ready,
/// including when it already was.
#[no_mangle]
pub extern "C" fn sgc_initialize_heap(min_size: usize, max_size: usize) -> bool {
    if RUNTIME.get().is_some() {
        return true;
    }

    let mut config = GcConfig::from_env();
    if min_size != 0 {
        config.min_heap_size = min_size;
    }
    if max_size != 0 {
        config.max_heap_size = max_size;
    }

    let runtime = match Runtime::new(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("sgc: failed to create runtime: {}", e);
            return false;
        },
    };
    if let Err(e) = runtime.start() {
        log::error!("sgc: failed to start runtime: {}", e);
        return false;
    }
    if RUNTIME.set(runtime).is_err() {
        // Lost a race with another initializer; theirs is in place and ours
        // shuts down on drop.
        log::debug!("sgc: runtime initialized concurrently");
    }
    true
}

/// Allocate `size` zeroed bytes, or null
///
/// The caller must be registered and must write an object header before
/// its next poll point.
#[no_mangle]
pub extern "C" fn sgc_allocate(size: usize) -> *mut c_void {
    let Some(runtime) = runtime() else {
        return std::ptr::null_mut();
    };
    match runtime.allocate(size) {
        Ok(addr) => addr as *mut c_void,
        Err(e) => {
            log::error!("sgc: allocation of {} bytes failed: {}", size, e);
            std::ptr::null_mut()
        },
    }
}

/// Attach the calling thread, optionally named by a NUL-terminated string
///
/// # Safety
/// `name` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn sgc_register_thread(name: *const c_char) -> bool {
    let Some(runtime) = runtime() else {
        return false;
    };
    let name = if name.is_null() {
        None
    } else {
        // SAFETY: non-null and NUL-terminated per the contract above.
        Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
    };
    report("thread registration", runtime.register_thread(name.as_deref()).map(|_| ()))
}

/// Detach the calling thread
#[no_mangle]
pub extern "C" fn sgc_deregister_thread() -> bool {
    runtime().is_some_and(|runtime| report("thread deregistration", runtime.deregister_thread()))
}

/// Poll point; returns `true` if the thread paused
#[no_mangle]
pub extern "C" fn sgc_poll_safepoint() -> bool {
    runtime().is_some_and(|runtime| runtime.poll_safepoint().unwrap_or(false))
}

/// Register `count` reference slots at `base` as roots
///
/// # Safety
/// The slots must stay valid and hold only null or object references
/// until unregistered.
#[no_mangle]
pub unsafe extern "C" fn sgc_register_global_roots(base: *mut usize, count: usize) -> bool {
    let Some(runtime) = runtime() else {
        return false;
    };
    // SAFETY: forwarded from this function's contract.
    report("root registration", unsafe {
        runtime.register_global_roots(base, count)
    })
}

#[no_mangle]
pub extern "C" fn sgc_unregister_global_roots(base: *mut usize) -> bool {
    runtime().is_some_and(|runtime| report("root removal", runtime.unregister_global_roots(base)))
}

/// Run a full collection and wait for it
#[no_mangle]
pub extern "C" fn sgc_collect() -> bool {
    runtime().is_some_and(|runtime| report("collection", runtime.collect()))
}

/// Stop the collector; fails while threads are still registered
#[no_mangle]
pub extern "C" fn sgc_shutdown() -> bool {
    runtime().is_some_and(|runtime| report("shutdown", runtime.stop()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_abi_lifecycle() {
        assert!(sgc_allocate(16).is_null());
        assert!(sgc_initialize_heap(1 << 20, 4 << 20));
        assert!(sgc_initialize_heap(0, 0));

        assert!(sgc_allocate(16).is_null(), "unregistered threads cannot allocate");
        let name = c"test-main";
        assert!(unsafe { sgc_register_thread(name.as_ptr()) });
        assert!(!unsafe { sgc_register_thread(std::ptr::null()) });

        let mut globals = [0usize; 2];
        assert!(unsafe { sgc_register_global_roots(globals.as_mut_ptr(), globals.len()) });
        assert!(sgc_collect());
        assert!(sgc_unregister_global_roots(globals.as_mut_ptr()));
        assert!(!sgc_poll_safepoint());

        assert!(!sgc_shutdown(), "registered threads block shutdown");
        assert!(sgc_deregister_thread());
        assert!(sgc_shutdown());
    }
}
