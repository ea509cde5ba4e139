//! Client side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! [`Client`] drives a 9P server over any connected byte stream and keeps
//! the session bookkeeping out of sight: fid allocation (always the
//! smallest unused number), tag allocation, and a buffer for replies that
//! arrive out of order. The convenience operations mirror what a shell
//! needs from a file server: `walk`, `ls`, `cd`, `mkdir`, `create`,
//! `open`, `read`, `write`, `remove`.

use {
    crate::{
        error,
        fcall::*,
        io_err, res, serialize,
        utils::Result,
    },
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::debug,
    std::{
        collections::{BTreeSet, HashMap},
        io::Cursor,
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpStream, ToSocketAddrs},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{Framed, LengthDelimitedCodec},
};

fn unexpected(fcall: Fcall) -> error::Error {
    error::Error::Proto(format!("unexpected reply: {:?}", MsgType::from(&fcall)))
}

/// Smallest non-negative fid not currently in use
fn smallest_unused(fids: &BTreeSet<u32>) -> u32 {
    let mut fid = 0;
    while fids.contains(&fid) {
        fid += 1;
    }
    fid
}

/// A connected 9P2000 client session.
///
/// Fid 0 is bound to the attach root for the whole life of the session;
/// `cd` moves a separate working-directory fid.
#[derive(Debug)]
pub struct Client<T> {
    framed: Framed<T, LengthDelimitedCodec>,
    msize: u32,
    root_fid: u32,
    current_fid: u32,
    fids: BTreeSet<u32>,
    replies: HashMap<u16, Msg>,
    next_tag: u16,
}

impl Client<TcpStream> {
    /// Dial `addr` and run the `Tversion`/`Tattach` handshake.
    pub async fn connect<A: ToSocketAddrs>(addr: A, uname: &str, aname: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::attach(stream, uname, aname).await
    }
}

impl<T> Client<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Begin a session on an already-connected stream: negotiate the
    /// version and message size, then attach fid 0 to the server's root.
    pub async fn attach(stream: T, uname: &str, aname: &str) -> Result<Client<T>> {
        let mut client = Client {
            framed: Framed::new(stream, serialize::frame_codec()),
            msize: MSIZE,
            root_fid: 0,
            current_fid: 0,
            fids: BTreeSet::new(),
            replies: HashMap::new(),
            next_tag: 0,
        };

        match client
            .rpc(Fcall::Tversion {
                msize: MSIZE,
                version: P92000.to_owned(),
            })
            .await?
        {
            Fcall::Rversion { msize, version } if version == P92000 => {
                client.msize = client.msize.min(msize);
            }
            Fcall::Rversion { version, .. } => {
                return res!(io_err!(
                    InvalidData,
                    format!("server protocol version {:?} is not supported", version)
                ));
            }
            other => return Err(unexpected(other)),
        }

        let root_fid = client.alloc_fid();
        match client
            .rpc(Fcall::Tattach {
                fid: root_fid,
                afid: NOFID,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await?
        {
            Fcall::Rattach { .. } => {}
            other => return Err(unexpected(other)),
        }

        client.root_fid = root_fid;
        client.current_fid = root_fid;

        Ok(client)
    }

    /// The negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.msize
    }

    fn alloc_fid(&mut self) -> u32 {
        let fid = smallest_unused(&self.fids);
        self.fids.insert(fid);
        fid
    }

    fn forget_fid(&mut self, fid: u32) {
        self.fids.remove(&fid);
    }

    fn next_tag(&mut self) -> u16 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        if self.next_tag == NOTAG {
            self.next_tag = 0;
        }
        tag
    }

    /// Send one T-message and wait for its reply. An `Rerror` comes back
    /// as `Err` carrying the ename.
    async fn rpc(&mut self, body: Fcall) -> Result<Fcall> {
        let tag = match body {
            Fcall::Tversion { .. } => NOTAG,
            _ => self.next_tag(),
        };
        let msg = Msg { tag, body };
        debug!("\t→ {:?}", msg);

        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, &msg)?;
        self.framed.send(writer.into_inner().freeze()).await?;

        let reply = self.wait_for(tag).await?;
        debug!("\t← {:?}", reply);

        match reply.body {
            Fcall::Rerror { ename } => Err(error::Error::Proto(ename)),
            body => Ok(body),
        }
    }

    /// Replies may arrive in any order when requests are pipelined;
    /// anything that is not ours is parked by tag until its requester
    /// comes looking.
    async fn wait_for(&mut self, tag: u16) -> Result<Msg> {
        if let Some(msg) = self.replies.remove(&tag) {
            return Ok(msg);
        }

        loop {
            let frame = self
                .framed
                .next()
                .await
                .ok_or_else(|| io_err!(UnexpectedEof, "connection closed"))??;
            let msg = serialize::read_msg(&mut frame.reader())?;
            if msg.tag == tag {
                return Ok(msg);
            }
            self.replies.insert(msg.tag, msg);
        }
    }

    /// Release server-side state for `fid`.
    pub async fn clunk(&mut self, fid: u32) -> Result<()> {
        self.rpc(Fcall::Tclunk { fid }).await?;
        self.forget_fid(fid);
        Ok(())
    }

    /// Clunk `fid` unless it is the root fid.
    async fn clunk_old(&mut self, fid: u32) -> Result<()> {
        if fid != self.root_fid {
            self.clunk(fid).await?;
        }
        Ok(())
    }

    /// Walk from the working directory to `path`, binding a fresh fid to
    /// the destination.
    ///
    /// Paths longer than `MAXWELEM` elements are walked in chunks through
    /// intermediate fids, which are clunked along the way.
    pub async fn walk(&mut self, path: &str) -> Result<u32> {
        let elements: Vec<String> = path
            .split('/')
            .filter(|e| !e.is_empty())
            .map(str::to_owned)
            .collect();

        let mut chunks: Vec<&[String]> = elements.chunks(MAXWELEM).collect();
        if chunks.is_empty() {
            // a zero-length walk still clones the fid
            chunks.push(&[]);
        }

        let mut fid = self.current_fid;

        for chunk in chunks {
            let newfid = self.alloc_fid();

            let reply = self
                .rpc(Fcall::Twalk {
                    fid,
                    newfid,
                    wnames: chunk.to_vec(),
                })
                .await;

            let wqids = match reply {
                Ok(Fcall::Rwalk { wqids }) => wqids,
                Ok(other) => {
                    self.forget_fid(newfid);
                    if fid != self.current_fid {
                        let _ = self.clunk_old(fid).await;
                    }
                    return Err(unexpected(other));
                }
                Err(e) => {
                    // nothing was bound to newfid on the server
                    self.forget_fid(newfid);
                    if fid != self.current_fid {
                        let _ = self.clunk_old(fid).await;
                    }
                    return Err(e);
                }
            };

            if wqids.len() < chunk.len() {
                self.forget_fid(newfid);
                if fid != self.current_fid {
                    let _ = self.clunk_old(fid).await;
                }
                return Err(error::Error::Proto(format!(
                    "No such file or directory: {}",
                    chunk[..wqids.len() + 1].join("/")
                )));
            }

            // drop the intermediate hop once we have walked past it
            if fid != self.current_fid {
                self.clunk_old(fid).await?;
            }
            fid = newfid;
        }

        Ok(fid)
    }

    /// Stat the object at `path`.
    pub async fn stat(&mut self, path: &str) -> Result<Stat> {
        let fid = self.walk(path).await?;
        let reply = self.rpc(Fcall::Tstat { fid }).await;
        let _ = self.clunk_old(fid).await;

        match reply? {
            Fcall::Rstat { stat } => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    /// List `path`: the stats of its entries for a directory, the file's
    /// own stat otherwise.
    pub async fn ls(&mut self, path: &str) -> Result<Vec<Stat>> {
        let fid = self.walk(path).await?;
        let result = self.ls_fid(fid).await;
        let _ = self.clunk_old(fid).await;
        result
    }

    async fn ls_fid(&mut self, fid: u32) -> Result<Vec<Stat>> {
        let stat = match self.rpc(Fcall::Tstat { fid }).await? {
            Fcall::Rstat { stat } => stat,
            other => return Err(unexpected(other)),
        };

        if stat.mode & dm::DIR == 0 {
            return Ok(vec![stat]);
        }

        match self
            .rpc(Fcall::Topen {
                fid,
                mode: om::READ,
            })
            .await?
        {
            Fcall::Ropen { .. } => {}
            other => return Err(unexpected(other)),
        }

        let count = self.msize.saturating_sub(IOHDRSZ);
        let mut data = Vec::new();
        loop {
            let chunk = match self
                .rpc(Fcall::Tread {
                    fid,
                    offset: data.len() as u64,
                    count,
                })
                .await?
            {
                Fcall::Rread { data } => data.0,
                other => return Err(unexpected(other)),
            };
            if chunk.is_empty() {
                break;
            }
            data.extend(chunk);
        }

        let mut stats = Vec::new();
        let mut cursor = Cursor::new(&data[..]);
        while (cursor.position() as usize) < data.len() {
            let stat: Stat = serialize::Decodable::decode(&mut cursor)?;
            stats.push(stat);
        }

        Ok(stats)
    }

    /// Move the working directory to `path`.
    pub async fn cd(&mut self, path: &str) -> Result<()> {
        let newfid = self.walk(path).await?;
        let old = self.current_fid;
        self.current_fid = newfid;
        self.clunk_old(old).await
    }

    /// Create the directory `path` with permission bits `perm`.
    pub async fn mkdir(&mut self, path: &str, perm: u32) -> Result<()> {
        self.create_entry(path, dm::DIR | perm, om::READ).await
    }

    /// Create the file `path` with permission bits `perm`, opened with
    /// `mode`. The creation fid is released; re-walk to use the file.
    pub async fn create(&mut self, path: &str, perm: u32, mode: u8) -> Result<()> {
        self.create_entry(path, perm, mode).await
    }

    async fn create_entry(&mut self, path: &str, perm: u32, mode: u8) -> Result<()> {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", path),
        };

        let fid = self.walk(dir).await?;
        let reply = self
            .rpc(Fcall::Tcreate {
                fid,
                name: name.to_owned(),
                perm,
                mode,
            })
            .await;
        let _ = self.clunk_old(fid).await;

        match reply? {
            Fcall::Rcreate { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Walk to `path` and open it, returning the open fid.
    pub async fn open(&mut self, path: &str, mode: u8) -> Result<u32> {
        let fid = self.walk(path).await?;

        match self.rpc(Fcall::Topen { fid, mode }).await {
            Ok(Fcall::Ropen { .. }) => Ok(fid),
            Ok(other) => {
                let _ = self.clunk_old(fid).await;
                Err(unexpected(other))
            }
            Err(e) => {
                let _ = self.clunk_old(fid).await;
                Err(e)
            }
        }
    }

    /// Read up to `count` bytes at `offset` from an open fid.
    pub async fn read(&mut self, fid: u32, offset: u64, count: u32) -> Result<Vec<u8>> {
        let count = count.min(self.msize.saturating_sub(IOHDRSZ));

        match self.rpc(Fcall::Tread { fid, offset, count }).await? {
            Fcall::Rread { data } => Ok(data.0),
            other => Err(unexpected(other)),
        }
    }

    /// Write `data` at `offset` through an open fid, chunked to the
    /// negotiated message size.
    pub async fn write(&mut self, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let chunk = self.msize.saturating_sub(IOHDRSZ) as usize;
        let mut written = 0;

        loop {
            let end = (written + chunk).min(data.len());
            let count = match self
                .rpc(Fcall::Twrite {
                    fid,
                    offset: offset + written as u64,
                    data: Data(data[written..end].to_vec()),
                })
                .await?
            {
                Fcall::Rwrite { count } => count as usize,
                other => return Err(unexpected(other)),
            };

            written += count;
            if written >= data.len() || count == 0 {
                break;
            }
        }

        if written != data.len() {
            return Err(error::Error::Proto(format!(
                "partial write: {} < {}",
                written,
                data.len()
            )));
        }

        Ok(written as u32)
    }

    /// Remove the object at `path`. The fid is gone afterwards whether or
    /// not the removal succeeded.
    pub async fn remove(&mut self, path: &str) -> Result<()> {
        let fid = self.walk(path).await?;
        let reply = self.rpc(Fcall::Tremove { fid }).await;
        self.forget_fid(fid);

        match reply? {
            Fcall::Rremove => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Clunk the root fid, telling the server to wind down the session.
    pub async fn disconnect(&mut self) -> Result<()> {
        let root = self.root_fid;
        self.rpc(Fcall::Tclunk { fid: root }).await?;
        self.fids.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::srv::{serve_session, tests::MemStore};
    use std::sync::Arc;
    use tokio::io::DuplexStream;

    async fn connected_with(store: MemStore) -> Client<DuplexStream> {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(theirs);
            let _ = serve_session(Arc::new(store), r, w).await;
        });

        Client::attach(ours, "test", "").await.unwrap()
    }

    async fn connected() -> Client<DuplexStream> {
        connected_with(MemStore::demo()).await
    }

    #[test]
    fn fids_are_allocated_smallest_first() {
        let mut fids = BTreeSet::new();
        assert_eq!(smallest_unused(&fids), 0);

        fids.extend([0, 1, 2]);
        assert_eq!(smallest_unused(&fids), 3);

        fids.remove(&1);
        assert_eq!(smallest_unused(&fids), 1);

        fids.remove(&0);
        assert_eq!(smallest_unused(&fids), 0);
    }

    #[tokio::test]
    async fn handshake_negotiates_msize() {
        let client = connected().await;
        assert_eq!(client.msize(), MSIZE);
    }

    #[tokio::test]
    async fn open_and_read_a_file() {
        let mut client = connected().await;
        let fid = client.open("dir/hello.txt", om::READ).await.unwrap();
        let data = client.read(fid, 0, 8192).await.unwrap();
        assert_eq!(data, b"Hello world!\n");
    }

    #[tokio::test]
    async fn ls_returns_sorted_entries() {
        let mut client = connected().await;
        let names: Vec<String> = client
            .ls("dir")
            .await
            .unwrap()
            .into_iter()
            .map(|stat| stat.name)
            .collect();
        assert_eq!(names, vec!["hello.txt".to_owned(), "\u{263a}".to_owned()]);
    }

    #[tokio::test]
    async fn ls_on_a_file_returns_its_own_stat() {
        let mut client = connected().await;
        let stats = client.ls("dir/hello.txt").await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "hello.txt");
        assert_eq!(stats[0].length, 13);
    }

    #[tokio::test]
    async fn stat_carries_unicode_names() {
        let mut client = connected().await;
        let stat = client.stat("dir/\u{263a}").await.unwrap();
        assert_eq!(stat.name, "\u{263a}");
        assert_eq!(stat.length, "Forståelse".len() as u64);
    }

    #[tokio::test]
    async fn walk_to_a_missing_path_fails_and_frees_the_fid() {
        let mut client = connected().await;
        assert!(client.walk("nope").await.is_err());

        // the failed walk's fid was returned to the pool
        let fid = client.walk("dir").await.unwrap();
        assert_eq!(fid, 1);
    }

    #[tokio::test]
    async fn fids_are_reused_after_clunk() {
        let mut client = connected().await;
        let first = client.walk("dir").await.unwrap();
        client.clunk(first).await.unwrap();

        let second = client.walk("dir").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cd_moves_the_working_directory() {
        let mut client = connected().await;
        client.cd("dir").await.unwrap();

        let fid = client.open("hello.txt", om::READ).await.unwrap();
        let data = client.read(fid, 0, 8192).await.unwrap();
        assert_eq!(data, b"Hello world!\n");
    }

    #[tokio::test]
    async fn long_walks_are_chunked() {
        let mut client = connected_with(MemStore::deep(40)).await;

        let path = vec!["d"; 40].join("/");
        let fid = client.walk(&path).await.unwrap();
        let reply = client.rpc(Fcall::Tstat { fid }).await.unwrap();
        assert!(matches!(reply, Fcall::Rstat { .. }));
    }

    #[tokio::test]
    async fn writes_to_a_readonly_store_error_with_the_server_ename() {
        let mut client = connected().await;
        let fid = client.open("dir/hello.txt", om::WRITE).await.unwrap();

        match client.write(fid, 0, b"hi").await {
            Err(e) => assert_eq!(e.ename(), "Read only."),
            Ok(_) => panic!("write must not succeed"),
        }
    }

    #[tokio::test]
    async fn disconnect_clunks_the_root() {
        let mut client = connected().await;
        client.disconnect().await.unwrap();
    }
}
