use std::ffi::CStr;
use std::io::Error as IoError;
use std::mem::MaybeUninit;

use libc::{uname, utsname};

/// System identification as returned by uname(2), used among others to
/// derive the kernel probe artifact matching the running kernel.
pub struct Utsname {
    u: utsname,
}

impl Utsname {
    pub fn from_sys() -> Result<Self, IoError> {
        let mut u: MaybeUninit<utsname> = MaybeUninit::zeroed();
        let result = unsafe { uname(u.as_mut_ptr()) };
        if result == -1 {
            return Err(IoError::last_os_error());
        }
        Ok(Self {
            u: unsafe { u.assume_init() },
        })
    }

    // utsname buffers are NUL terminated by the kernel
    fn field(buf: &[libc::c_char]) -> String {
        unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    pub fn sysname(&self) -> String {
        Self::field(&self.u.sysname)
    }

    pub fn nodename(&self) -> String {
        Self::field(&self.u.nodename)
    }

    pub fn release(&self) -> String {
        Self::field(&self.u.release)
    }

    pub fn machine(&self) -> String {
        Self::field(&self.u.machine)
    }
}

#[cfg(test)]
mod test {
    use super::Utsname;

    #[test]
    fn test_uname() {
        let u = Utsname::from_sys().unwrap();
        assert_eq!(u.sysname(), "Linux");
        assert!(!u.release().is_empty());
        assert!(!u.machine().is_empty());
    }
}
