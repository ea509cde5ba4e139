//! Read-only store over an in-memory dictionary tree.

use {
    async_trait::async_trait,
    std::{
        collections::BTreeMap,
        hash::{DefaultHasher, Hash, Hasher},
        time::{SystemTime, UNIX_EPOCH},
    },
    styx::{Error, Result, errstr, fcall::*, serialize::Encodable, srv::Store},
};

/// One node of the served tree.
pub enum Node {
    File(String),
    /// Entries keyed by name; a BTreeMap keeps listings sorted for free
    Dir(BTreeMap<String, Node>),
}

/// The tree never changes, so a path hash is a stable, unique identity.
fn qid_for(path: &str, node: &Node) -> Qid {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);

    Qid {
        typ: match node {
            Node::Dir(_) => QidType::DIR,
            Node::File(_) => QidType::FILE,
        },
        version: 0,
        path: hasher.finish(),
    }
}

/// Presents a fixed [`Node`] tree as a read-only filesystem: directories
/// listable, files readable, every mutation refused.
pub struct DictStore {
    root: Node,
    now: u32,
}

impl DictStore {
    pub fn new(root: Node) -> DictStore {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        DictStore { root, now }
    }

    /// The demonstration tree served by the binary.
    pub fn demo() -> DictStore {
        let mut dir = BTreeMap::new();
        dir.insert(
            "hello.txt".to_owned(),
            Node::File("Hello world!\n".to_owned()),
        );
        dir.insert("\u{263a}".to_owned(), Node::File("Forståelse".to_owned()));

        let mut top = BTreeMap::new();
        top.insert("dir".to_owned(), Node::Dir(dir));

        DictStore::new(Node::Dir(top))
    }

    fn traverse(&self, path: &str) -> Result<&Node> {
        let mut node = &self.root;
        for element in path.split('/').filter(|e| !e.is_empty()) {
            node = match node {
                Node::Dir(entries) => entries
                    .get(element)
                    .ok_or_else(|| Error::proto(errstr::ENOENT))?,
                Node::File(_) => return Err(Error::proto(errstr::ENOENT)),
            };
        }
        Ok(node)
    }

    fn stat_node(&self, path: &str, node: &Node) -> Stat {
        let (mode, length) = match node {
            Node::Dir(_) => (dm::DIR | 0o555, 0),
            Node::File(data) => (0o444, data.len() as u64),
        };

        Stat {
            typ: 0,
            dev: 0,
            qid: qid_for(path, node),
            mode,
            atime: self.now,
            mtime: self.now,
            length,
            name: path.rsplit('/').next().unwrap_or("").to_owned(),
            uid: "inferno".to_owned(),
            gid: "inferno".to_owned(),
            muid: String::new(),
        }
    }
}

#[async_trait]
impl Store for DictStore {
    async fn attach(&self, _uname: &str, _aname: &str) -> Result<Qid> {
        self.qid("").await
    }

    async fn qid(&self, path: &str) -> Result<Qid> {
        Ok(qid_for(path, self.traverse(path)?))
    }

    async fn stat(&self, path: &str) -> Result<Stat> {
        Ok(self.stat_node(path, self.traverse(path)?))
    }

    async fn read(&self, path: &str, offset: u64, count: u32) -> Result<Vec<u8>> {
        let blob = match self.traverse(path)? {
            Node::File(data) => data.as_bytes().to_vec(),
            Node::Dir(entries) => {
                let mut data = Vec::new();
                for (name, node) in entries {
                    let child = if path.is_empty() {
                        name.clone()
                    } else {
                        format!("{}/{}", path, name)
                    };
                    self.stat_node(&child, node).encode(&mut data)?;
                }
                data
            }
        };

        let start = (offset as usize).min(blob.len());
        let end = (offset as usize)
            .saturating_add(count as usize)
            .min(blob.len());
        Ok(blob[start..end].to_vec())
    }

    async fn write(&self, _path: &str, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(Error::proto(errstr::EREAD_ONLY))
    }

    async fn remove(&self, _path: &str) -> Result<()> {
        Err(Error::proto("Cannot remove dictionary entries."))
    }

    async fn wstat(&self, _path: &str, _stat: &Stat) -> Result<Option<String>> {
        // nothing the dictionary cares to record
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn files_read_back_their_utf8_bytes() {
        let store = DictStore::demo();
        let data = store.read("dir/hello.txt", 0, 8192).await.unwrap();
        assert_eq!(data, b"Hello world!\n");

        let data = store.read("dir/\u{263a}", 0, 8192).await.unwrap();
        assert_eq!(data, "Forståelse".as_bytes());

        // slicing happens on bytes, not characters
        let head = store.read("dir/\u{263a}", 0, 5).await.unwrap();
        assert_eq!(head, &"Forståelse".as_bytes()[..5]);
    }

    #[tokio::test]
    async fn qids_are_stable_and_distinct() {
        let store = DictStore::demo();
        let dir = store.qid("dir").await.unwrap();
        let file = store.qid("dir/hello.txt").await.unwrap();

        assert!(dir.typ.contains(QidType::DIR));
        assert!(!file.typ.contains(QidType::DIR));
        assert_ne!(dir.path, file.path);
        assert_eq!(store.qid("dir").await.unwrap(), dir);
    }

    #[tokio::test]
    async fn mutations_are_refused() {
        let store = DictStore::demo();

        let err = store.write("dir/hello.txt", 0, b"x").await.unwrap_err();
        assert_eq!(err.ename(), errstr::EREAD_ONLY);

        let err = store.remove("dir/hello.txt").await.unwrap_err();
        assert_eq!(err.ename(), "Cannot remove dictionary entries.");

        let err = store.create("dir", "x", 0o644).await.unwrap_err();
        assert_eq!(err.ename(), errstr::ECANNOT_CREATE);
    }
}
