//! User and group resolution through the system account databases.
//!
//! Names go through `getpwnam_r(3)` and `getgrnam_r(3)`, so every NSS
//! source configured on the host (files, LDAP, sssd, systemd dynamic
//! users) is consulted.

use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;

use crate::error::CommitError;

const INITIAL_BUFFER: usize = 1024;
const MAX_BUFFER: usize = 1 << 20;

/// Signature shared by `getpwnam_r` and `getgrnam_r`.
type Lookup<T> = unsafe extern "C" fn(
    *const libc::c_char,
    *mut T,
    *mut libc::c_char,
    libc::size_t,
    *mut *mut T,
) -> libc::c_int;

/// Resolves a user name or numeric uid.
pub fn resolve_user(name: &str) -> Result<u32, CommitError> {
    if let Ok(id) = name.parse() {
        return Ok(id);
    }
    match lookup::<libc::passwd>(name, libc::getpwnam_r, |entry| entry.pw_uid) {
        Ok(Some(uid)) => Ok(uid),
        Ok(None) => Err(CommitError::UnknownUser(name.to_string())),
        Err(source) => Err(CommitError::AccountLookup {
            name: name.to_string(),
            source,
        }),
    }
}

/// Resolves a group name or numeric gid.
pub fn resolve_group(name: &str) -> Result<u32, CommitError> {
    if let Ok(id) = name.parse() {
        return Ok(id);
    }
    match lookup::<libc::group>(name, libc::getgrnam_r, |entry| entry.gr_gid) {
        Ok(Some(gid)) => Ok(gid),
        Ok(None) => Err(CommitError::UnknownGroup(name.to_string())),
        Err(source) => Err(CommitError::AccountLookup {
            name: name.to_string(),
            source,
        }),
    }
}

/// Runs a reentrant account lookup, growing the scratch buffer on `ERANGE`.
///
/// Returns `Ok(None)` when the name has no entry.
#[allow(unsafe_code)]
fn lookup<T>(name: &str, call: Lookup<T>, id: fn(&T) -> u32) -> io::Result<Option<u32>> {
    let Ok(c_name) = CString::new(name) else {
        return Ok(None);
    };
    let mut buf: Vec<libc::c_char> = vec![0; INITIAL_BUFFER];
    loop {
        let mut entry = MaybeUninit::<T>::uninit();
        let mut result: *mut T = std::ptr::null_mut();
        // SAFETY: `c_name` is NUL-terminated, `entry` and `result` are valid
        // for writes, and `buf.len()` is the length of the buffer passed.
        let rc = unsafe {
            call(
                c_name.as_ptr(),
                entry.as_mut_ptr(),
                buf.as_mut_ptr(),
                buf.len(),
                &raw mut result,
            )
        };
        match rc {
            0 if result.is_null() => return Ok(None),
            // SAFETY: a non-null result points at `entry`, filled in by the call.
            0 => return Ok(Some(id(unsafe { &*result }))),
            libc::ERANGE if buf.len() < MAX_BUFFER => buf.resize(buf.len() * 2, 0),
            // Some NSS modules report a missing name as an error code.
            libc::ENOENT | libc::ESRCH => return Ok(None),
            code => return Err(io::Error::from_raw_os_error(code)),
        }
    }
}
