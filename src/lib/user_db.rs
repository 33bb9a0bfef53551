//! User database lookups
//!
//! Resolves an account name to its passwd entry. The system backend reads
//! the operating system's user database through `getpwnam_r`; the static
//! backend is an in-memory table for fixtures and tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// A single entry of the user database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
    pub shell: Option<PathBuf>,
}

/// Lookup of accounts by name
pub trait UserDatabase {
    /// Find the entry for `username`, failing with `Error::UnknownUser` if absent
    fn lookup(&self, username: &str) -> Result<UserRecord>;

    /// Home directory of `username`
    fn home_dir(&self, username: &str) -> Result<PathBuf> {
        self.lookup(username).map(|record| record.home)
    }
}

impl<T: UserDatabase + ?Sized> UserDatabase for &T {
    fn lookup(&self, username: &str) -> Result<UserRecord> {
        (**self).lookup(username)
    }
}

impl<T: UserDatabase + ?Sized> UserDatabase for std::sync::Arc<T> {
    fn lookup(&self, username: &str) -> Result<UserRecord> {
        (**self).lookup(username)
    }
}

/// The operating system's user database
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUserDatabase;

impl SystemUserDatabase {
    pub fn new() -> Self {
        Self
    }
}

impl UserDatabase for SystemUserDatabase {
    #[cfg(unix)]
    fn lookup(&self, username: &str) -> Result<UserRecord> {
        let record = sys::getpwnam(username)?;
        debug!(user = username, home = %record.home.display(), "resolved user");
        Ok(record)
    }

    #[cfg(not(unix))]
    fn lookup(&self, _username: &str) -> Result<UserRecord> {
        Err(Error::Unsupported("user database lookup"))
    }
}

#[cfg(unix)]
mod sys {
    use std::ffi::{CStr, CString};
    use std::io;
    use std::mem::MaybeUninit;
    use std::path::PathBuf;
    use std::ptr;

    use super::UserRecord;
    use crate::error::{Error, Result};

    const INITIAL_BUFFER: usize = 1024;
    const MAX_BUFFER: usize = 1 << 20;

    pub(super) fn getpwnam(username: &str) -> Result<UserRecord> {
        // A name with an interior NUL cannot exist in the database
        let c_name = match CString::new(username) {
            Ok(name) => name,
            Err(_) => return Err(Error::UnknownUser(username.to_string())),
        };

        let mut buf_len = initial_buffer_len();
        loop {
            let mut buf: Vec<libc::c_char> = vec![0; buf_len];
            let mut pwd = MaybeUninit::<libc::passwd>::uninit();
            let mut result: *mut libc::passwd = ptr::null_mut();

            let rc = unsafe {
                libc::getpwnam_r(
                    c_name.as_ptr(),
                    pwd.as_mut_ptr(),
                    buf.as_mut_ptr(),
                    buf.len(),
                    &mut result,
                )
            };

            if rc == libc::ERANGE && buf_len < MAX_BUFFER {
                buf_len *= 2;
                continue;
            }

            if result.is_null() {
                // Not-found is reported as rc 0 or one of these, depending on libc
                return match rc {
                    0 | libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM => {
                        Err(Error::UnknownUser(username.to_string()))
                    }
                    errno => Err(Error::UserLookup {
                        username: username.to_string(),
                        source: io::Error::from_raw_os_error(errno),
                    }),
                };
            }

            let pwd = unsafe { pwd.assume_init() };
            return Ok(unsafe { to_record(&pwd) });
        }
    }

    fn initial_buffer_len() -> usize {
        let suggested = unsafe { libc::sysconf(libc::_SC_GETPW_R_SIZE_MAX) };
        if suggested > 0 {
            suggested as usize
        } else {
            INITIAL_BUFFER
        }
    }

    unsafe fn to_record(pwd: &libc::passwd) -> UserRecord {
        let string_at = |p: *const libc::c_char| -> Option<String> {
            if p.is_null() {
                None
            } else {
                Some(CStr::from_ptr(p).to_string_lossy().into_owned())
            }
        };

        UserRecord {
            name: string_at(pwd.pw_name).unwrap_or_default(),
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
            home: PathBuf::from(string_at(pwd.pw_dir).unwrap_or_default()),
            shell: string_at(pwd.pw_shell)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }
}

/// In-memory user database
#[derive(Debug, Default, Clone)]
pub struct StaticUserDatabase {
    users: BTreeMap<String, UserRecord>,
}

impl StaticUserDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a user with the given home directory; ids are assigned from 1000
    pub fn with_user(mut self, name: &str, home: impl AsRef<Path>) -> Self {
        let id = 1000 + self.users.len() as u32;
        self.insert(UserRecord {
            name: name.to_string(),
            uid: id,
            gid: id,
            home: home.as_ref().to_path_buf(),
            shell: Some(PathBuf::from("/bin/sh")),
        });
        self
    }

    pub fn insert(&mut self, record: UserRecord) {
        self.users.insert(record.name.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl UserDatabase for StaticUserDatabase {
    fn lookup(&self, username: &str) -> Result<UserRecord> {
        self.users
            .get(username)
            .cloned()
            .ok_or_else(|| Error::UnknownUser(username.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_lookup() {
        let db = StaticUserDatabase::new()
            .with_user("deploy", "/srv/deploy")
            .with_user("app", "/home/app");
        let record = db.lookup("deploy").unwrap();
        assert_eq!(record.home, PathBuf::from("/srv/deploy"));
        assert_eq!(record.uid, 1000);
        assert_eq!(db.lookup("app").unwrap().uid, 1001);
        assert_eq!(db.home_dir("app").unwrap(), PathBuf::from("/home/app"));
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn test_static_unknown_user() {
        let db = StaticUserDatabase::new();
        assert!(db.is_empty());
        match db.lookup("ghost") {
            Err(Error::UnknownUser(name)) => assert_eq!(name, "ghost"),
            other => panic!("expected UnknownUser, got {:?}", other),
        }
    }

    #[test]
    fn test_database_through_reference() {
        let db = StaticUserDatabase::new().with_user("deploy", "/srv/deploy");
        let by_ref: &dyn UserDatabase = &db;
        assert_eq!(by_ref.home_dir("deploy").unwrap(), PathBuf::from("/srv/deploy"));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_lookup_root() {
        let record = SystemUserDatabase::new().lookup("root").unwrap();
        assert_eq!(record.uid, 0);
        assert_eq!(record.name, "root");
        assert!(record.home.is_absolute());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_lookup_unknown() {
        let err = SystemUserDatabase::new()
            .lookup("this_user_definitely_does_not_exist_12345")
            .unwrap_err();
        assert!(err.is_user_lookup());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_lookup_interior_nul() {
        let err = SystemUserDatabase::new().lookup("ro\0ot").unwrap_err();
        assert!(matches!(err, Error::UnknownUser(_)));
    }
}
