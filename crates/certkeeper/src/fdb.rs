//! Flat-file database: a typed view of a rooted directory tree.
//!
//! Values are small files inside nested collections (directories). All writes
//! go through [`Writer`], which buffers into a sibling `tmp/` directory and
//! renames into place on commit, so readers only ever observe a file before
//! or after a write, never during. Symbolic links are exposed as [`Link`]
//! records whose targets are relative to the database root.
//!
//! Opening the database walks the tree and enforces a per-path mode policy,
//! so key material stays 0600 even if something else touched the tree.

use std::fs::{self, DirBuilder};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::{symlink, DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

/// Mode policy for one subtree (or glob) of the database.
///
/// `path` is a `/`-separated pattern relative to the root; `*` matches
/// exactly one path component. `"."` is the default entry for the whole
/// tree. The most specific matching entry wins; later entries win ties.
pub struct Permission {
    pub path: &'static str,
    pub dir_mode: u32,
    pub file_mode: u32,
}

struct DbInner {
    root: PathBuf,
    permissions: &'static [Permission],
}

/// Handle on an open database. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

const TMP_DIR: &str = "tmp";

impl Db {
    /// Open (creating if necessary) the database rooted at `root` and
    /// enforce the mode policy across the existing tree.
    pub fn open(root: &Path, permissions: &'static [Permission]) -> Result<Db> {
        fs::create_dir_all(root).with_context(|| format!("create db root {:?}", root))?;

        let inner = Arc::new(DbInner {
            root: root.to_path_buf(),
            permissions,
        });
        let db = Db { inner };

        db.inner.enforce_tree()?;
        db.inner.make_dir_all(TMP_DIR)?;
        db.inner.clear_tmp();

        Ok(db)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Handle on a collection; `name` may be a `/`-separated path.
    pub fn collection(&self, name: &str) -> Collection {
        Collection {
            inner: self.inner.clone(),
            rel: name.trim_matches('/').to_string(),
        }
    }
}

impl DbInner {
    fn mode_for(&self, rel: &str, is_dir: bool) -> u32 {
        let mut best: Option<(usize, &Permission)> = None;
        for p in self.permissions {
            if pattern_matches_prefix(p.path, rel) {
                let score = if p.path == "." {
                    0
                } else {
                    p.path.split('/').count()
                };
                if best.map(|(s, _)| score >= s).unwrap_or(true) {
                    best = Some((score, p));
                }
            }
        }
        match best {
            Some((_, p)) if is_dir => p.dir_mode,
            Some((_, p)) => p.file_mode,
            None if is_dir => 0o755,
            None => 0o644,
        }
    }

    /// Create every missing directory on the way to `rel`, each with the
    /// mode the policy assigns to its own path.
    fn make_dir_all(&self, rel: &str) -> Result<()> {
        let mut sofar = String::new();
        for comp in rel.split('/').filter(|c| !c.is_empty()) {
            if !sofar.is_empty() {
                sofar.push('/');
            }
            sofar.push_str(comp);
            let abs = self.root.join(&sofar);
            if !abs.is_dir() {
                DirBuilder::new()
                    .mode(self.mode_for(&sofar, true))
                    .create(&abs)
                    .or_else(|e| {
                        // lost the race against ourselves; fine
                        if abs.is_dir() {
                            Ok(())
                        } else {
                            Err(e)
                        }
                    })
                    .with_context(|| format!("create directory {:?}", abs))?;
            }
        }
        Ok(())
    }

    fn enforce_tree(&self) -> Result<()> {
        self.enforce_path("")?;
        Ok(())
    }

    fn enforce_path(&self, rel: &str) -> Result<()> {
        let abs = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        };

        let meta = fs::symlink_metadata(&abs).with_context(|| format!("stat {:?}", abs))?;
        if meta.file_type().is_symlink() {
            return Ok(());
        }

        let euid = unsafe { libc::geteuid() };
        if meta.uid() != euid {
            warn!(path = ?abs, uid = meta.uid(), "database path owned by another user");
        }

        let want = self.mode_for(if rel.is_empty() { "." } else { rel }, meta.is_dir());
        if meta.permissions().mode() & 0o7777 != want {
            debug!(path = ?abs, mode = %format_args!("{:04o}", want), "fixing mode");
            fs::set_permissions(&abs, fs::Permissions::from_mode(want))
                .with_context(|| format!("chmod {:?}", abs))?;
        }

        if meta.is_dir() {
            for entry in fs::read_dir(&abs).with_context(|| format!("read dir {:?}", abs))? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let child = if rel.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{}", rel, name)
                };
                self.enforce_path(&child)?;
            }
        }

        Ok(())
    }

    /// Remove stale temporaries left behind by a previous crash.
    fn clear_tmp(&self) {
        let tmp = self.root.join(TMP_DIR);
        if let Ok(entries) = fs::read_dir(&tmp) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// `*` matches exactly one component; the pattern may also be a prefix of
/// the path, so `accounts` matches everything under `accounts/`.
fn pattern_matches_prefix(pattern: &str, rel: &str) -> bool {
    if pattern == "." {
        return true;
    }
    let pat: Vec<&str> = pattern.split('/').collect();
    let path: Vec<&str> = rel.split('/').collect();
    if pat.len() > path.len() {
        return false;
    }
    pat.iter().zip(&path).all(|(p, c)| *p == "*" || p == c)
}

/// A symbolic link, target relative to the database root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub target: String,
}

/// Handle on one directory of the database.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<DbInner>,
    rel: String,
}

impl Collection {
    fn dir(&self) -> PathBuf {
        self.inner.root.join(&self.rel)
    }

    fn depth(&self) -> usize {
        if self.rel.is_empty() {
            0
        } else {
            self.rel.split('/').count()
        }
    }

    pub fn subcollection(&self, name: &str) -> Collection {
        Collection {
            inner: self.inner.clone(),
            rel: format!("{}/{}", self.rel, name.trim_matches('/')),
        }
    }

    /// Names of all entries, sorted. A missing directory is an empty
    /// collection, not an error.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(self.dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e).with_context(|| format!("list {:?}", self.dir())),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.dir().join(name).exists()
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir().join(name);
        let mut buf = Vec::new();
        fs::File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut buf))
            .with_context(|| format!("read {:?}", path))?;
        Ok(buf)
    }

    pub fn read_opt(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.dir().join(name)) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {:?}", self.dir().join(name))),
        }
    }

    pub fn read_string(&self, name: &str) -> Result<String> {
        String::from_utf8(self.read(name)?)
            .with_context(|| format!("{:?}/{} is not UTF-8", self.rel, name))
    }

    /// Open a scoped writer for `name`. Nothing becomes visible until
    /// [`Writer::commit`]; a dropped writer leaves no trace.
    pub fn create(&self, name: &str) -> Result<Writer> {
        self.inner.make_dir_all(&self.rel)?;
        self.inner.make_dir_all(TMP_DIR)?;

        let rel_dest = format!("{}/{}", self.rel, name);
        let tmp = self
            .inner
            .root
            .join(TMP_DIR)
            .join(format!("w.{}", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .with_context(|| format!("create temporary for {:?}", rel_dest))?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;

        Ok(Writer {
            file: Some(file),
            tmp,
            dest: self.dir().join(name),
            mode: self.inner.mode_for(&rel_dest, false),
            committed: false,
        })
    }

    /// Write `bytes` to `name` in one atomic step.
    pub fn write(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut w = self.create(name)?;
        w.write_all(bytes)?;
        w.commit()
    }

    /// Remove `name`; removing something absent is a no-op.
    pub fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.dir().join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete {:?}/{}", self.rel, name)),
        }
    }

    /// Read the link named `name`, returning its root-relative target.
    /// `None` if no such link exists.
    pub fn read_link(&self, name: &str) -> Result<Option<Link>> {
        let path = self.dir().join(name);
        let target = match fs::read_link(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("readlink {:?}", path)),
        };

        if target.is_absolute() {
            bail!("malformed link {:?}: absolute target {:?}", path, target);
        }

        // Resolve the relative target against the link's own directory and
        // re-express it relative to the root.
        let mut parts: Vec<String> = self
            .rel
            .split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        for comp in target.components() {
            match comp {
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        bail!("malformed link {:?}: escapes database root", path);
                    }
                }
                Component::Normal(c) => parts.push(c.to_string_lossy().to_string()),
                Component::CurDir => {}
                _ => bail!("malformed link {:?}: target {:?}", path, target),
            }
        }
        Ok(Some(Link {
            target: parts.join("/"),
        }))
    }

    /// Point the link named `name` at the given root-relative target,
    /// replacing any existing link atomically.
    pub fn write_link(&self, name: &str, link: &Link) -> Result<()> {
        self.inner.make_dir_all(&self.rel)?;
        self.inner.make_dir_all(TMP_DIR)?;

        let mut rel_target = String::new();
        for _ in 0..self.depth() {
            rel_target.push_str("../");
        }
        rel_target.push_str(&link.target);

        let tmp = self
            .inner
            .root
            .join(TMP_DIR)
            .join(format!("l.{}", Uuid::new_v4()));
        symlink(&rel_target, &tmp).with_context(|| format!("symlink {:?}", tmp))?;
        let dest = self.dir().join(name);
        fs::rename(&tmp, &dest).with_context(|| format!("install link {:?}", dest))?;
        Ok(())
    }
}

/// Scoped atomic file writer: buffers into `tmp/`, renames into place on
/// [`commit`](Writer::commit), removes the temporary on drop otherwise.
pub struct Writer {
    file: Option<fs::File>,
    tmp: PathBuf,
    dest: PathBuf,
    mode: u32,
    committed: bool,
}

impl Writer {
    pub fn commit(mut self) -> Result<()> {
        let file = self.file.take().expect("writer already closed");
        file.sync_all()
            .with_context(|| format!("sync {:?}", self.tmp))?;
        drop(file);
        fs::set_permissions(&self.tmp, fs::Permissions::from_mode(self.mode))?;
        fs::rename(&self.tmp, &self.dest)
            .with_context(|| format!("install {:?}", self.dest))?;
        self.committed = true;
        Ok(())
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.as_mut().expect("writer closed").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().expect("writer closed").flush()
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.file.take());
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    static PERMS: &[Permission] = &[
        Permission {
            path: ".",
            dir_mode: 0o755,
            file_mode: 0o644,
        },
        Permission {
            path: "keys",
            dir_mode: 0o700,
            file_mode: 0o600,
        },
        Permission {
            path: "certs/*/secret",
            dir_mode: 0o700,
            file_mode: 0o600,
        },
        Permission {
            path: "tmp",
            dir_mode: 0o700,
            file_mode: 0o600,
        },
    ];

    fn open(dir: &TempDir) -> Db {
        Db::open(dir.path(), PERMS).unwrap()
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let c = db.collection("certs/abc");
        c.write("url", b"https://example.com/cert/1").unwrap();
        assert_eq!(c.read("url").unwrap(), b"https://example.com/cert/1");
        assert_eq!(db.collection("certs").list().unwrap(), vec!["abc"]);
    }

    #[test]
    fn test_aborted_writer_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let c = db.collection("keys/k1");
        {
            let mut w = c.create("privkey").unwrap();
            w.write_all(b"secret material").unwrap();
            // dropped without commit
        }
        assert!(!c.exists("privkey"));
        let tmp: Vec<_> = fs::read_dir(dir.path().join("tmp")).unwrap().collect();
        assert!(tmp.is_empty(), "tmp/ must be empty after abort");
    }

    #[test]
    fn test_reader_never_sees_partial_write() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let c = db.collection("conf");
        c.write("target", b"old").unwrap();

        let mut w = c.create("target").unwrap();
        w.write_all(b"new contents, much longer").unwrap();
        // not yet committed: readers still see the old bytes
        assert_eq!(c.read("target").unwrap(), b"old");
        w.commit().unwrap();
        assert_eq!(c.read("target").unwrap(), b"new contents, much longer");
    }

    #[test]
    fn test_file_modes_follow_policy() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.collection("keys/k1").write("privkey", b"k").unwrap();
        db.collection("certs/c1").write("url", b"u").unwrap();

        let key_mode = fs::metadata(dir.path().join("keys/k1/privkey"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o7777, 0o600);
        let url_mode = fs::metadata(dir.path().join("certs/c1/url"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(url_mode & 0o7777, 0o644);
    }

    #[test]
    fn test_open_repairs_modes() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.collection("keys/k1").write("privkey", b"k").unwrap();
        }
        let path = dir.path().join("keys/k1/privkey");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        let _ = open(&dir);
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o600);
    }

    #[test]
    fn test_link_round_trip_at_depth() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.collection("keys/k1").write("privkey", b"k").unwrap();

        let c = db.collection("certs/c1");
        c.write_link(
            "privkey",
            &Link {
                target: "keys/k1/privkey".into(),
            },
        )
        .unwrap();

        let lnk = c.read_link("privkey").unwrap().unwrap();
        assert_eq!(lnk.target, "keys/k1/privkey");
        // the symlink actually resolves
        assert_eq!(
            fs::read(dir.path().join("certs/c1/privkey")).unwrap(),
            b"k"
        );
    }

    #[test]
    fn test_link_replacement() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let live = db.collection("live");
        live.write_link(
            "a.test",
            &Link {
                target: "certs/one".into(),
            },
        )
        .unwrap();
        live.write_link(
            "a.test",
            &Link {
                target: "certs/two".into(),
            },
        )
        .unwrap();
        assert_eq!(
            live.read_link("a.test").unwrap().unwrap().target,
            "certs/two"
        );
    }

    #[test]
    fn test_missing_collection_lists_empty() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        assert!(db.collection("desired").list().unwrap().is_empty());
        assert!(db.collection("desired").read_opt("x").unwrap().is_none());
    }

    #[test]
    fn test_glob_component_matching() {
        assert!(pattern_matches_prefix(".", "anything/at/all"));
        assert!(pattern_matches_prefix("certs/*/secret", "certs/abc/secret"));
        assert!(!pattern_matches_prefix("certs/*/secret", "certs/abc/url"));
        assert!(pattern_matches_prefix("keys", "keys/k1/privkey"));
        assert!(!pattern_matches_prefix("keys/extra/deep", "keys"));
    }
}
