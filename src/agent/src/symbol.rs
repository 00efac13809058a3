//! ST — Symbol/Binding Probe.
//!
//! Answers "is this symbol actually defined by the main executable, as a
//! global function with default visibility" using the dynamic linker's own
//! address-to-object query rather than an offline ELF parse. Mirrors
//! `func_found_in_executable` in the original bash remediation: `dlsym`
//! against the main program's handle, then `dladdr1` twice (once for the
//! owning link map, once for the symbol table entry) to check the binding,
//! type and visibility bits and that the owning object has no name (the
//! dynamic linker's convention for "the executable itself").

use log::debug;
use nix::libc::{c_void, dlclose, dlopen, dlsym, RTLD_LAZY};
use scopeject_common::error::CoreError;
use std::ffi::{c_char, c_int, CString};
use std::ptr;

// `dladdr1` and the link-map/symtab-entry shapes it hands back are a glibc
// extension the `libc` crate doesn't wrap; declared here the same way the
// original queries them.
#[repr(C)]
struct DlInfo {
    dli_fname: *const c_char,
    dli_fbase: *mut c_void,
    dli_sname: *const c_char,
    dli_saddr: *mut c_void,
}

#[repr(C)]
struct LinkMap {
    l_addr: u64,
    l_name: *const c_char,
    l_ld: *const c_void,
    l_next: *mut c_void,
    l_prev: *mut c_void,
}

#[repr(C)]
struct Elf64Sym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

const RTLD_DL_LINKMAP: c_int = 2;
const RTLD_DL_SYMENT: c_int = 1;
const STB_GLOBAL: u8 = 1;
const STT_FUNC: u8 = 2;
const STV_DEFAULT: u8 = 0;

unsafe extern "C" {
    fn dladdr1(
        addr: *const c_void,
        info: *mut DlInfo,
        extra_info: *mut *mut c_void,
        flags: c_int,
    ) -> c_int;
}

/// Open the main executable's handle, as `dlopen(NULL, RTLD_LAZY)` does.
/// Callers are responsible for `dlclose`-ing the result.
fn open_main_executable() -> Result<*mut c_void, CoreError> {
    let handle = unsafe { dlopen(ptr::null(), RTLD_LAZY) };
    if handle.is_null() {
        return Err(CoreError::NotFound("dlopen(NULL) failed".into()));
    }
    Ok(handle)
}

/// Look up `symbol` in the main executable and return its address, if any.
pub fn lookup_in_main_executable(symbol: &str) -> Result<Option<*mut c_void>, CoreError> {
    let cname = CString::new(symbol)
        .map_err(|_| CoreError::ProtocolViolation(format!("symbol has embedded NUL: {symbol}")))?;
    let handle = open_main_executable()?;
    let addr = unsafe { dlsym(handle, cname.as_ptr()) };
    unsafe { dlclose(handle) };
    Ok(if addr.is_null() { None } else { Some(addr) })
}

/// True if `symbol` is defined by the main executable itself (not by a
/// shared library it links against) as a global function with default
/// visibility.
pub fn is_defined_in_main_executable(symbol: &str) -> Result<bool, CoreError> {
    let Some(addr) = lookup_in_main_executable(symbol)? else {
        debug!("symbol {symbol} not found via dlsym");
        return Ok(false);
    };

    let mut info = unsafe { std::mem::zeroed::<DlInfo>() };
    let mut link_map_ptr: *mut c_void = ptr::null_mut();
    let mut sym_ptr: *mut c_void = ptr::null_mut();

    let ok_linkmap = unsafe {
        dladdr1(addr as *const c_void, &mut info, &mut link_map_ptr, RTLD_DL_LINKMAP)
    };
    let ok_syment = unsafe {
        dladdr1(addr as *const c_void, &mut info, &mut sym_ptr, RTLD_DL_SYMENT)
    };

    if ok_linkmap == 0 || ok_syment == 0 || link_map_ptr.is_null() || sym_ptr.is_null() {
        return Err(CoreError::ProtocolViolation(format!(
            "dladdr1 could not resolve owning object for {symbol}"
        )));
    }

    let link_map = unsafe { &*(link_map_ptr as *const LinkMap) };
    let elf_sym = unsafe { &*(sym_ptr as *const Elf64Sym) };

    let owned_by_executable = link_map.l_name.is_null() || unsafe { *link_map.l_name == 0 };
    let bind = elf_sym.st_info >> 4;
    let kind = elf_sym.st_info & 0xf;
    let vis = elf_sym.st_other & 0x3;

    let matches = owned_by_executable && bind == STB_GLOBAL && kind == STT_FUNC && vis == STV_DEFAULT;
    debug!(
        "symbol {symbol}: owned_by_executable={owned_by_executable} bind={bind} type={kind} vis={vis} -> {matches}"
    );
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_a_real_libc_symbol_on_the_executable_or_its_libs() {
        // `main` is always defined by the test binary itself.
        let found = lookup_in_main_executable("main").unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn unknown_symbol_is_not_found() {
        let found = lookup_in_main_executable("__definitely_not_a_real_symbol__").unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn symbol_with_embedded_nul_is_protocol_violation() {
        let err = is_defined_in_main_executable("bad\0name").unwrap_err();
        assert!(matches!(err, CoreError::ProtocolViolation(_)));
    }
}
