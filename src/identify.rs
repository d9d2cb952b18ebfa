use core::ffi::CStr;

/// The name of the dynamic symbol containing `addr`, if the dynamic linker
/// knows one. Used to name native frames in stack dumps.
pub fn identify(addr: usize) -> Option<&'static str> {
    unsafe {
        let mut info: libc::Dl_info = core::mem::zeroed();

        if libc::dladdr(addr as _, &mut info) == 0 || info.dli_sname.is_null() {
            return None;
        }

        // SAFETY: dladdr returns names from the loaded objects' string
        // tables, which live as long as the objects stay loaded.
        CStr::from_ptr(info.dli_sname).to_str().ok()
    }
}
