//! The POSIX-backed store: serves a subtree of the host filesystem.

use {
    async_trait::async_trait,
    filetime::FileTime,
    std::{
        fs::Metadata,
        io::{self, SeekFrom},
        os::unix::fs::{MetadataExt, PermissionsExt},
        path::PathBuf,
    },
    styx::{Error, Result, errstr, fcall::*, serialize::Encodable, srv::Store},
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    },
};

fn qid_from_attr(attr: &Metadata) -> Qid {
    Qid {
        typ: if attr.is_dir() {
            QidType::DIR
        } else {
            QidType::FILE
        },
        version: 0,
        // the inode number uniquely identifies the object at this location
        path: attr.ino(),
    }
}

/// Serves the directory tree rooted at `root` over 9P.
///
/// Qids are derived from inode numbers, so they stay stable across walks
/// and renames for as long as the object lives.
pub struct FileStore {
    root: PathBuf,
    uid: String,
}

impl FileStore {
    pub fn new(root: PathBuf) -> FileStore {
        let uid = std::env::var("USER").unwrap_or_else(|_| "styx".to_owned());
        FileStore { root, uid }
    }

    fn real_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    async fn stat_path(&self, path: &str) -> Result<Stat> {
        let attr = fs::metadata(self.real_path(path)).await?;

        let perm = attr.permissions().mode() & 0o777;
        let (mode, length) = if attr.is_dir() {
            (dm::DIR | perm, 0)
        } else {
            (perm, attr.len())
        };

        Ok(Stat {
            typ: 0,
            dev: 0,
            qid: qid_from_attr(&attr),
            mode,
            atime: attr.atime() as u32,
            mtime: attr.mtime() as u32,
            length,
            name: path.rsplit('/').next().unwrap_or("").to_owned(),
            uid: self.uid.clone(),
            gid: self.uid.clone(),
            muid: String::new(),
        })
    }
}

#[async_trait]
impl Store for FileStore {
    async fn attach(&self, _uname: &str, _aname: &str) -> Result<Qid> {
        self.qid("").await
    }

    async fn qid(&self, path: &str) -> Result<Qid> {
        let attr = fs::metadata(self.real_path(path)).await?;
        Ok(qid_from_attr(&attr))
    }

    async fn stat(&self, path: &str) -> Result<Stat> {
        self.stat_path(path).await
    }

    async fn open(&self, path: &str, mode: u8) -> Result<()> {
        let real = self.real_path(path);
        let attr = fs::metadata(&real).await?;

        let io_mode = mode & 3;
        if attr.is_dir() {
            if io_mode == om::WRITE || io_mode == om::RDWR {
                return Err(Error::proto(errstr::EISDIR));
            }
            return Ok(());
        }

        if mode & om::TRUNC != 0 {
            fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&real)
                .await?;
        }

        Ok(())
    }

    async fn create(&self, dirpath: &str, name: &str, perm: u32) -> Result<Qid> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(Error::proto(errstr::ENAMETOOLONG));
        }

        let dir = self.real_path(dirpath);
        let attr = fs::metadata(&dir).await?;
        if !attr.is_dir() {
            return Err(Error::proto(errstr::ENOTDIR));
        }
        let dir_perm = attr.permissions().mode() & 0o777;

        let target = dir.join(name);
        if fs::try_exists(&target).await? {
            return Err(Error::proto(errstr::EEXIST));
        }

        // Plan 9 create: the requested bits are masked by the parent's
        if perm & dm::DIR != 0 {
            let mode = perm & (!0o777 | (dir_perm & 0o777)) & 0o777;
            let mut builder = fs::DirBuilder::new();
            builder.mode(mode);
            builder.create(&target).await?;
        } else {
            let mode = perm & (!0o666 | (dir_perm & 0o666)) & 0o777;
            fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode)
                .open(&target)
                .await?;
        }

        let attr = fs::metadata(&target).await?;
        Ok(qid_from_attr(&attr))
    }

    async fn read(&self, path: &str, offset: u64, count: u32) -> Result<Vec<u8>> {
        let real = self.real_path(path);
        let attr = fs::metadata(&real).await?;

        if attr.is_dir() {
            let mut names = Vec::new();
            let mut entries = fs::read_dir(&real).await?;
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();

            let mut data = Vec::new();
            for name in names {
                let child = if path.is_empty() {
                    name
                } else {
                    format!("{}/{}", path, name)
                };
                self.stat_path(&child).await?.encode(&mut data)?;
            }

            let start = (offset as usize).min(data.len());
            let end = (offset as usize)
                .saturating_add(count as usize)
                .min(data.len());
            Ok(data[start..end].to_vec())
        } else {
            let mut file = fs::File::open(&real).await?;
            file.seek(SeekFrom::Start(offset)).await?;

            let mut buf = vec![0; count as usize];
            let bytes = file.read(&mut buf[..]).await?;
            buf.truncate(bytes);
            Ok(buf)
        }
    }

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32> {
        let real = self.real_path(path);
        if fs::metadata(&real).await?.is_dir() {
            return Err(Error::proto(errstr::ENOT_A_FILE));
        }

        let mut file = fs::OpenOptions::new().write(true).open(&real).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;

        Ok(data.len() as u32)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::proto(errstr::EPERM_RMROOT));
        }

        let real = self.real_path(path);
        if fs::metadata(&real).await?.is_dir() {
            fs::remove_dir(&real).await?;
        } else {
            fs::remove_file(&real).await?;
        }

        Ok(())
    }

    async fn wstat(&self, path: &str, stat: &Stat) -> Result<Option<String>> {
        let mut real = self.real_path(path);
        let mut renamed = None;

        // a non-empty, different name renames within the same directory
        let old_name = path.rsplit('/').next().unwrap_or("");
        if !stat.name.is_empty() && stat.name != old_name {
            if stat.name == "." || stat.name == ".." || stat.name.contains('/') {
                return Err(Error::proto(errstr::ENAMETOOLONG));
            }

            let new_real = match real.parent() {
                Some(parent) => parent.join(&stat.name),
                None => return Err(Error::proto(errstr::EPERM_WSTAT)),
            };
            fs::rename(&real, &new_real).await?;
            real = new_real;

            renamed = Some(match path.rsplit_once('/') {
                Some((dir, _)) => format!("{}/{}", dir, stat.name),
                None => stat.name.clone(),
            });
        }

        if stat.mode != !0 {
            fs::set_permissions(&real, PermissionsExt::from_mode(stat.mode & 0o777)).await?;
        }

        if stat.length != !0 {
            fs::OpenOptions::new()
                .write(true)
                .open(&real)
                .await?
                .set_len(stat.length)
                .await?;
        }

        if stat.atime != !0 || stat.mtime != !0 {
            let attr = fs::metadata(&real).await?;
            let atime = if stat.atime != !0 {
                FileTime::from_unix_time(stat.atime as i64, 0)
            } else {
                FileTime::from_last_access_time(&attr)
            };
            let mtime = if stat.mtime != !0 {
                FileTime::from_unix_time(stat.mtime as i64, 0)
            } else {
                FileTime::from_last_modification_time(&attr)
            };

            let target = real.clone();
            tokio::task::spawn_blocking(move || filetime::set_file_times(target, atime, mtime))
                .await
                .map_err(|e| Error::Io(io::Error::other(e)))??;
        }

        Ok(renamed)
    }
}
