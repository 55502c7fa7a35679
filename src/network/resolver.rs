//! Resolver configuration file management

use crate::state::StateDir;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Failed to access resolver file {path}: {source}")]
    IoError { path: PathBuf, source: io::Error },
}

const RESOLVER_MARKER: &str = "# Generated by vmc-connect";

/// Contents of the resolver file before the session touched it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverState {
    /// Managed by something else (symlink to resolvconf/systemd-resolved)
    Symlink,
    Absent,
    Present(String),
}

pub struct ResolverFile {
    path: PathBuf,
}

impl ResolverFile {
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> ResolverError {
        ResolverError::IoError {
            path: self.path.clone(),
            source,
        }
    }

    pub fn is_symlink(&self) -> bool {
        fs::symlink_metadata(&self.path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    /// Read the current state, following symlinks only when asked
    pub fn inspect(&self, follow_symlink: bool) -> Result<ResolverState, ResolverError> {
        if !follow_symlink && self.is_symlink() {
            return Ok(ResolverState::Symlink);
        }
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(ResolverState::Present(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ResolverState::Absent),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Current contents, `None` if missing
    pub fn read(&self) -> Result<Option<String>, ResolverError> {
        match self.inspect(true)? {
            ResolverState::Present(content) => Ok(Some(content)),
            _ => Ok(None),
        }
    }

    pub fn write_servers(&self, servers: &[IpAddr]) -> Result<(), ResolverError> {
        self.write(&render_servers(servers))
    }

    /// Replace the contents via a temp file and `rename`
    ///
    /// A symlinked path is written at its target, so the link survives.
    pub fn write(&self, content: &str) -> Result<(), ResolverError> {
        let target = self.target();
        let tmp = StateDir::temp_path(&target);
        let io_error = |source| ResolverError::IoError {
            path: target.clone(),
            source,
        };

        fs::write(&tmp, content).map_err(io_error)?;
        let result = match fs::metadata(&target) {
            Ok(meta) => fs::set_permissions(&tmp, meta.permissions()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
        .and_then(|()| fs::rename(&tmp, &target));

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(e));
        }
        Ok(())
    }

    /// The regular file behind the path, resolving symlinks
    fn target(&self) -> PathBuf {
        if !self.is_symlink() {
            return self.path.clone();
        }
        if let Ok(resolved) = fs::canonicalize(&self.path) {
            return resolved;
        }
        // Dangling link: create the file it points at
        match fs::read_link(&self.path) {
            Ok(link) if link.is_absolute() => link,
            Ok(link) => self
                .path
                .parent()
                .map(|parent| parent.join(&link))
                .unwrap_or(link),
            Err(_) => self.path.clone(),
        }
    }

    /// Remove the file, returning whether it existed
    ///
    /// A symlink is kept and the file it points at removed.
    pub fn remove(&self) -> Result<bool, ResolverError> {
        match fs::remove_file(self.target()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Whether the current file was written by a session
    pub fn is_session_file(&self) -> bool {
        self.read()
            .ok()
            .flatten()
            .map(|c| c.starts_with(RESOLVER_MARKER))
            .unwrap_or(false)
    }
}

fn render_servers(servers: &[IpAddr]) -> String {
    let mut content = String::from(RESOLVER_MARKER);
    content.push_str(" for the active mobile broadband session\n");
    for server in servers {
        content.push_str(&format!("nameserver {}\n", server));
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn resolver_in(dir: &TempDir) -> ResolverFile {
        ResolverFile::with_path(dir.path().join("resolv.conf"))
    }

    #[test]
    fn test_render_servers() {
        let content = render_servers(&[
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
        ]);

        assert!(content.starts_with(RESOLVER_MARKER));
        assert!(content.contains("nameserver 10.0.0.2\n"));
        assert!(content.contains("nameserver 10.0.0.3\n"));
    }

    #[test]
    fn test_inspect_absent_and_present() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver_in(&dir);

        assert_eq!(resolver.inspect(false).unwrap(), ResolverState::Absent);

        resolver.write("nameserver 1.1.1.1\n").unwrap();
        assert_eq!(
            resolver.inspect(false).unwrap(),
            ResolverState::Present("nameserver 1.1.1.1\n".to_string())
        );
    }

    #[test]
    fn test_inspect_symlink() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("stub-resolv.conf");
        fs::write(&target, "nameserver 127.0.0.53\n").unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("resolv.conf")).unwrap();
        let resolver = resolver_in(&dir);

        assert_eq!(resolver.inspect(false).unwrap(), ResolverState::Symlink);
        assert_eq!(
            resolver.inspect(true).unwrap(),
            ResolverState::Present("nameserver 127.0.0.53\n".to_string())
        );
    }

    #[test]
    fn test_session_file_detection() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver_in(&dir);

        resolver.write("nameserver 1.1.1.1\n").unwrap();
        assert!(!resolver.is_session_file());

        resolver
            .write_servers(&[IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))])
            .unwrap();
        assert!(resolver.is_session_file());
    }

    #[test]
    fn test_write_through_symlink_keeps_link() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("stub-resolv.conf");
        fs::write(&target, "nameserver 127.0.0.53\n").unwrap();
        std::os::unix::fs::symlink("stub-resolv.conf", dir.path().join("resolv.conf")).unwrap();
        let resolver = resolver_in(&dir);

        resolver.write("nameserver 10.0.0.2\n").unwrap();

        assert!(resolver.is_symlink());
        assert_eq!(fs::read_to_string(&target).unwrap(), "nameserver 10.0.0.2\n");
    }

    #[test]
    fn test_write_through_dangling_symlink() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("stub-resolv.conf", dir.path().join("resolv.conf")).unwrap();
        let resolver = resolver_in(&dir);

        resolver.write("nameserver 10.0.0.2\n").unwrap();

        assert!(resolver.is_symlink());
        assert_eq!(
            fs::read_to_string(dir.path().join("stub-resolv.conf")).unwrap(),
            "nameserver 10.0.0.2\n"
        );

        assert!(resolver.remove().unwrap());
        assert!(resolver.is_symlink());
        assert!(!dir.path().join("stub-resolv.conf").exists());
    }

    #[test]
    fn test_write_replaces_atomically() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let resolver = resolver_in(&dir);
        resolver.write("nameserver 1.1.1.1\n").unwrap();
        fs::set_permissions(resolver.path(), fs::Permissions::from_mode(0o644)).unwrap();

        resolver.write("nameserver 10.0.0.2\n").unwrap();

        assert_eq!(resolver.read().unwrap().unwrap(), "nameserver 10.0.0.2\n");
        let mode = fs::metadata(resolver.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let resolver = resolver_in(&dir);
        resolver.write("x").unwrap();

        assert!(resolver.remove().unwrap());
        assert!(!resolver.remove().unwrap());
    }
}
