//! Scratch files holding plaintext while a secret is edited
//!
//! A [`ScratchFile`] lives in the vault directory with mode 0600 and is
//! removed on every exit path: explicitly via [`ScratchFile::remove`], on
//! drop (errors and panics), and from a signal handler for SIGINT, SIGTERM
//! and SIGHUP. The handler only calls `unlink`, which is async-signal-safe,
//! on paths registered ahead of time, then re-raises the signal.

use std::ffi::CString;
use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Once;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

const SLOTS: usize = 8;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicPtr<libc::c_char> = AtomicPtr::new(ptr::null_mut());

static PENDING: [AtomicPtr<libc::c_char>; SLOTS] = [EMPTY; SLOTS];
/// Number of live [`DeferInterrupts`] guards
static DEFER_INTERRUPT: AtomicUsize = AtomicUsize::new(0);
static INSTALL: Once = Once::new();

extern "C" fn cleanup_and_reraise(signal: libc::c_int) {
    // The editor owns the terminal; Ctrl-C is for it
    if signal == libc::SIGINT && DEFER_INTERRUPT.load(Ordering::SeqCst) > 0 {
        return;
    }

    for slot in PENDING.iter() {
        let path = slot.swap(ptr::null_mut(), Ordering::SeqCst);
        if !path.is_null() {
            unsafe {
                libc::unlink(path);
            }
        }
    }

    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

fn install_handlers() {
    INSTALL.call_once(|| {
        for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            unsafe {
                libc::signal(
                    signal,
                    cleanup_and_reraise as extern "C" fn(libc::c_int) as libc::sighandler_t,
                );
            }
        }
    });
}

/// A path the signal handler will unlink; unregistered on drop
struct Registration {
    slot: usize,
}

impl Registration {
    fn new(path: &Path) -> Option<Self> {
        install_handlers();

        let raw = CString::new(path.as_os_str().as_bytes()).ok()?.into_raw();
        for (slot, pending) in PENDING.iter().enumerate() {
            if pending
                .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(Self { slot });
            }
        }

        drop(unsafe { CString::from_raw(raw) });
        tracing::warn!(path = %path.display(), "no signal cleanup slot left for scratch file");
        None
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let raw = PENDING[self.slot].swap(ptr::null_mut(), Ordering::SeqCst);
        if !raw.is_null() {
            drop(unsafe { CString::from_raw(raw) });
        }
    }
}

/// Keeps Ctrl-C from killing us while an editor runs in the foreground
pub struct DeferInterrupts;

impl DeferInterrupts {
    pub fn new() -> Self {
        install_handlers();
        DEFER_INTERRUPT.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Default for DeferInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferInterrupts {
    fn drop(&mut self) {
        DEFER_INTERRUPT.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Private temporary file for a secret's plaintext
pub struct ScratchFile {
    // Declared first so the file is unlinked before the registration goes away
    file: Option<NamedTempFile>,
    _registration: Option<Registration>,
}

impl ScratchFile {
    /// Create `.tmp.<name>.XXXXXX` in `dir`, readable by the owner only
    pub fn create(dir: &Path, name: &str) -> io::Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(&format!(".tmp.{}.", name))
            .tempfile_in(dir)?;
        fs::set_permissions(file.path(), Permissions::from_mode(0o600))?;

        let registration = Registration::new(file.path());

        Ok(Self {
            file: Some(file),
            _registration: registration,
        })
    }

    pub fn path(&self) -> &Path {
        match &self.file {
            Some(file) => file.path(),
            None => Path::new(""),
        }
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "scratch file removed"))?;
        file.write_all(data)?;
        file.as_file().sync_all()
    }

    /// Read the current contents by path; editors may have replaced the file
    pub fn read_back(&self) -> io::Result<Zeroizing<Vec<u8>>> {
        fs::read(self.path()).map(Zeroizing::new)
    }

    /// Delete the file now, reporting failure instead of swallowing it
    pub fn remove(mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => file.close(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use tempfile::tempdir;

    #[test]
    fn test_created_private_in_vault() {
        let dir = tempdir().unwrap();
        let scratch = ScratchFile::create(dir.path(), "db-password").unwrap();

        assert_eq!(scratch.path().parent(), Some(dir.path()));
        let name = scratch.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".tmp.db-password."));

        let mode = fs::metadata(scratch.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let mut scratch = ScratchFile::create(dir.path(), "token").unwrap();

        scratch.write_all(b"hunter2").unwrap();
        assert_eq!(scratch.read_back().unwrap().as_slice(), b"hunter2");

        // An editor that saves by replacing the file
        fs::write(scratch.path(), b"correct horse").unwrap();
        assert_eq!(scratch.read_back().unwrap().as_slice(), b"correct horse");
    }

    #[test]
    fn test_remove_and_drop_delete_the_file() {
        let dir = tempdir().unwrap();

        let scratch = ScratchFile::create(dir.path(), "a").unwrap();
        let path = scratch.path().to_path_buf();
        scratch.remove().unwrap();
        assert!(!path.exists());

        let scratch = ScratchFile::create(dir.path(), "b").unwrap();
        let path = scratch.path().to_path_buf();
        drop(scratch);
        assert!(!path.exists());
    }

    #[test]
    fn test_registration_holds_path_until_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".tmp.registered");

        let registration = Registration::new(&path).unwrap();
        let slot = registration.slot;
        let raw = PENDING[slot].load(Ordering::SeqCst);
        let registered = unsafe { CStr::from_ptr(raw) };
        assert_eq!(registered.to_bytes(), path.as_os_str().as_bytes());

        drop(registration);
        assert!(PENDING[slot].load(Ordering::SeqCst).is_null());
    }

    const CHILD_DIR: &str = "CONSPIRE_SCRATCH_CHILD_DIR";
    const CHILD_DEFER: &str = "CONSPIRE_SCRATCH_CHILD_DEFER";

    /// Body of the child process the signal tests spawn: create a scratch
    /// file, report its path through `ready`, then wait to be signalled
    #[test]
    #[ignore = "run as a child process by the signal tests"]
    fn scratch_child_waits_for_signal() {
        let Some(dir) = std::env::var_os(CHILD_DIR) else {
            return;
        };
        let dir = std::path::PathBuf::from(dir);

        let _defer = std::env::var_os(CHILD_DEFER).map(|_| DeferInterrupts::new());
        let scratch = ScratchFile::create(&dir, "secret").unwrap();
        fs::write(dir.join("ready.part"), scratch.path().as_os_str().as_bytes()).unwrap();
        fs::rename(dir.join("ready.part"), dir.join("ready")).unwrap();

        std::thread::sleep(std::time::Duration::from_secs(30));
    }

    struct Child {
        process: std::process::Child,
        scratch: std::path::PathBuf,
    }

    impl Child {
        fn spawn(dir: &Path, defer: bool) -> Self {
            let mut command = std::process::Command::new(std::env::current_exe().unwrap());
            command
                .args([
                    "--exact",
                    "scratch::tests::scratch_child_waits_for_signal",
                    "--ignored",
                    "--test-threads=1",
                ])
                .env(CHILD_DIR, dir)
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null());
            if defer {
                command.env(CHILD_DEFER, "1");
            }
            let process = command.spawn().unwrap();

            let ready = dir.join("ready");
            for _ in 0..200 {
                if let Ok(path) = fs::read(&ready) {
                    let scratch = std::path::PathBuf::from(std::ffi::OsStr::from_bytes(&path));
                    return Self { process, scratch };
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            panic!("child never created its scratch file");
        }

        fn signal(&self, signal: libc::c_int) {
            let rc = unsafe { libc::kill(self.process.id() as libc::pid_t, signal) };
            assert_eq!(rc, 0);
        }

        fn wait_for_signal(mut self) -> Option<i32> {
            use std::os::unix::process::ExitStatusExt;
            self.process.wait().unwrap().signal()
        }
    }

    #[test]
    fn test_sigterm_removes_scratch_file() {
        let dir = tempdir().unwrap();
        let child = Child::spawn(dir.path(), false);
        let scratch = child.scratch.clone();
        assert!(scratch.exists());

        child.signal(libc::SIGTERM);
        assert_eq!(child.wait_for_signal(), Some(libc::SIGTERM));
        assert!(!scratch.exists());
    }

    #[test]
    fn test_sigint_deferred_while_editor_runs() {
        let dir = tempdir().unwrap();
        let mut child = Child::spawn(dir.path(), true);
        let scratch = child.scratch.clone();

        child.signal(libc::SIGINT);
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(child.process.try_wait().unwrap().is_none());
        assert!(scratch.exists());

        // Other signals still clean up
        child.signal(libc::SIGHUP);
        assert_eq!(child.wait_for_signal(), Some(libc::SIGHUP));
        assert!(!scratch.exists());
    }

    #[test]
    fn test_defer_interrupts_while_guard_lives() {
        let _outer = DeferInterrupts::new();
        {
            let _inner = DeferInterrupts::new();
            assert!(DEFER_INTERRUPT.load(Ordering::SeqCst) >= 2);
        }
        assert!(DEFER_INTERRUPT.load(Ordering::SeqCst) >= 1);
    }
}
