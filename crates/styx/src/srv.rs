//! Server side 9P library.
//!
//! # Protocol
//! 9P2000
//!
//! The pieces here are split the way the protocol wants them split:
//!
//! * [`Store`] realizes a tree of files. It is addressed purely by
//!   `/`-separated paths (the root is `""`) and open-mode hints, and holds
//!   no per-client state, so one store instance can back every connection.
//! * The per-connection session engine owns the fid table,
//!   enforces the fid lifetime rules (attach → walk → open/create →
//!   read/write → clunk) and translates store failures into `Rerror`.
//!
//! [`srv_async`] and [`srv_listener`] wire sessions to a TCP accept loop,
//! one task per connection. Within a connection requests are handled
//! strictly in receive order, so replies leave in that same order and
//! `Tflush` never has anything to cancel.

use {
    crate::{
        error::{self, string as errstr},
        fcall::*,
        serialize,
        utils::Result,
    },
    async_trait::async_trait,
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    log::{debug, error, info},
    num_traits::FromPrimitive,
    std::{collections::HashMap, sync::Arc},
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::TcpListener,
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

/// Filesystem backend contract.
///
/// Implementors describe a file tree to the session engine. All paths are
/// `/`-separated and rooted at the empty string; `dir/hello.txt` names the
/// file `hello.txt` inside the root's `dir`.
///
/// Read-only stores only need [`attach`](Self::attach), [`qid`](Self::qid),
/// [`stat`](Self::stat) and [`read`](Self::read); every mutating operation
/// defaults to a refusal.
///
/// A store shared across connections must synchronize its own mutable
/// state; the engine calls it from one task per connection.
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve the root of the tree for an attaching user.
    ///
    /// An `Err` refuses the attach.
    async fn attach(&self, uname: &str, aname: &str) -> Result<Qid>;

    /// Return the qid of the object at `path`, `Err` if nothing lives
    /// there.
    ///
    /// The qid's `path` field must be stable for the life of the object
    /// and unique among co-existing objects.
    async fn qid(&self, path: &str) -> Result<Qid>;

    /// Describe the object at `path`.
    async fn stat(&self, path: &str) -> Result<Stat>;

    /// Validate an open of `path` with the given `om` mode bits.
    async fn open(&self, _path: &str, _mode: u8) -> Result<()> {
        Ok(())
    }

    /// Create `name` inside the directory at `dirpath` and return the new
    /// object's qid. Must reject `"."`, `".."` and existing names.
    async fn create(&self, _dirpath: &str, _name: &str, _perm: u32) -> Result<Qid> {
        Err(error::Error::proto(errstr::ECANNOT_CREATE))
    }

    /// Read a byte range.
    ///
    /// For a directory this is the concatenation of the stat encodings of
    /// its entries in name order, sliced to `[offset, offset + count)`;
    /// for a file it is the requested range, short at end of file.
    async fn read(&self, path: &str, offset: u64, count: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes written.
    async fn write(&self, _path: &str, _offset: u64, _data: &[u8]) -> Result<u32> {
        Err(error::Error::proto(errstr::EREAD_ONLY))
    }

    /// Remove the object at `path`.
    async fn remove(&self, _path: &str) -> Result<()> {
        Err(error::Error::proto(errstr::EROFS))
    }

    /// Apply the non-sentinel fields of a `Twstat` stat. Returns the
    /// object's new path when the stat carried a rename.
    async fn wstat(&self, _path: &str, _stat: &Stat) -> Result<Option<String>> {
        Err(error::Error::proto(errstr::EPERM_WSTAT))
    }
}

/// What a session knows about one client fid.
#[derive(Clone, Debug)]
struct FidEntry {
    qid: Qid,
    path: String,
    /// Open mode recorded by `Topen`/`Tcreate`, `None` while un-opened
    mode: Option<u8>,
}

/// Per-connection protocol engine: negotiated msize, fid table, root fid.
pub(crate) struct Session<S> {
    store: Arc<S>,
    msize: u32,
    fids: HashMap<u32, FidEntry>,
    root_fid: Option<u32>,
    hangup: bool,
}

impl<S: Store> Session<S> {
    pub(crate) fn new(store: Arc<S>) -> Session<S> {
        Session {
            store,
            msize: MSIZE,
            fids: HashMap::new(),
            root_fid: None,
            hangup: false,
        }
    }

    /// True once a `Tclunk` of the root fid asked for the session to end.
    pub(crate) fn hangup(&self) -> bool {
        self.hangup
    }

    fn entry(&self, fid: u32) -> Result<&FidEntry> {
        self.fids
            .get(&fid)
            .ok_or_else(|| error::Error::proto(errstr::EBADF))
    }

    /// Handle one request and build the reply carrying the same tag.
    pub(crate) async fn handle(&mut self, msg: Msg) -> Msg {
        debug!("\t← {:?}", msg);

        let body = self
            .dispatch(msg.body)
            .await
            .unwrap_or_else(|e| Fcall::Rerror { ename: e.ename() });
        let reply = Msg { tag: msg.tag, body };

        debug!("\t→ {:?}", reply);
        reply
    }

    async fn dispatch(&mut self, body: Fcall) -> Result<Fcall> {
        use crate::Fcall::*;

        match body {
            Tversion { msize, version } => self.version(msize, &version).await,
            Tattach {
                fid,
                afid,
                uname,
                aname,
            } => self.attach(fid, afid, &uname, &aname).await,
            Tflush { oldtag: _ } => self.flush().await,
            Twalk {
                fid,
                newfid,
                wnames,
            } => self.walk(fid, newfid, &wnames).await,
            Topen { fid, mode } => self.open(fid, mode).await,
            Tcreate {
                fid,
                name,
                perm,
                mode,
            } => self.create(fid, &name, perm, mode).await,
            Tread { fid, offset, count } => self.read(fid, offset, count).await,
            Twrite { fid, offset, data } => self.write(fid, offset, &data).await,
            Tclunk { fid } => self.clunk(fid).await,
            Tremove { fid } => self.remove(fid).await,
            Tstat { fid } => self.stat(fid).await,
            Twstat { fid, stat } => self.wstat(fid, &stat).await,
            _ => Err(error::Error::proto(errstr::EUNSUPPORTED)),
        }
    }

    async fn version(&mut self, msize: u32, version: &str) -> Result<Fcall> {
        // a fresh Tversion aborts whatever the session was doing
        self.fids.clear();
        self.root_fid = None;
        self.msize = msize.min(MSIZE);

        Ok(Fcall::Rversion {
            msize: self.msize,
            version: if version.starts_with("9P") {
                P92000
            } else {
                VERSION_UNKNOWN
            }
            .to_owned(),
        })
    }

    async fn attach(&mut self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<Fcall> {
        if afid != NOFID {
            return Err(error::Error::proto(errstr::EAUTH));
        }
        if self.fids.contains_key(&fid) {
            return Err(error::Error::proto(errstr::EBADF_IN_USE));
        }

        let qid = self
            .store
            .attach(uname, aname)
            .await
            .map_err(|_| error::Error::proto(errstr::EROOT))?;

        self.fids.insert(
            fid,
            FidEntry {
                qid,
                path: String::new(),
                mode: None,
            },
        );
        self.root_fid = Some(fid);

        Ok(Fcall::Rattach { qid })
    }

    async fn flush(&mut self) -> Result<Fcall> {
        // requests are handled one at a time, so there is never a pending
        // request left to cancel
        Ok(Fcall::Rflush)
    }

    async fn walk(&mut self, fid: u32, newfid: u32, wnames: &[String]) -> Result<Fcall> {
        let (mut qid, path) = {
            let entry = self.entry(fid)?;
            if entry.mode.is_some() {
                return Err(error::Error::proto(errstr::EBADF_USE));
            }
            (entry.qid, entry.path.clone())
        };

        // walk names are single path elements; a '/' inside one would
        // smuggle arbitrary paths past the element-by-element resolution
        if wnames.iter().any(|name| name.contains('/')) {
            return Err(error::Error::proto(errstr::ENAMETOOLONG));
        }

        let mut elements: Vec<&str> = path.split('/').filter(|e| !e.is_empty()).collect();
        let mut wqids = Vec::with_capacity(wnames.len());

        for name in wnames {
            if name.as_str() == ".." {
                // no-op at the root
                elements.pop();
            } else {
                elements.push(name.as_str());
            }

            match self.store.qid(&elements.join("/")).await {
                Ok(q) => {
                    qid = q;
                    wqids.push(q);
                }
                // a miss on the first element is an error; a later miss
                // reports the partial walk and leaves newfid unbound
                Err(_) if wqids.is_empty() => {
                    return Err(error::Error::proto(errstr::ENOENT));
                }
                Err(_) => return Ok(Fcall::Rwalk { wqids }),
            }
        }

        self.fids.insert(
            newfid,
            FidEntry {
                qid,
                path: elements.join("/"),
                mode: None,
            },
        );

        Ok(Fcall::Rwalk { wqids })
    }

    async fn open(&mut self, fid: u32, mode: u8) -> Result<Fcall> {
        let (qid, path) = {
            let entry = self.entry(fid)?;
            if entry.mode.is_some() {
                return Err(error::Error::proto(errstr::EOPEN));
            }
            (entry.qid, entry.path.clone())
        };

        self.store
            .open(&path, mode)
            .await
            .map_err(|_| error::Error::proto(errstr::ECANNOT_OPEN))?;

        if let Some(entry) = self.fids.get_mut(&fid) {
            entry.mode = Some(mode);
        }

        // iounit 0 tells the client to size payloads from msize
        Ok(Fcall::Ropen { qid, iounit: 0 })
    }

    async fn create(&mut self, fid: u32, name: &str, perm: u32, mode: u8) -> Result<Fcall> {
        let dirpath = {
            let entry = self.entry(fid)?;
            if entry.mode.is_some() {
                return Err(error::Error::proto(errstr::EBADF_USE));
            }
            if !entry.qid.typ.contains(QidType::DIR) {
                return Err(error::Error::proto(errstr::ENOTDIR));
            }
            entry.path.clone()
        };

        let qid = self.store.create(&dirpath, name, perm).await?;

        // the fid is rebound to the new object, then opened
        let path = if dirpath.is_empty() {
            name.to_owned()
        } else {
            format!("{}/{}", dirpath, name)
        };
        self.fids.insert(
            fid,
            FidEntry {
                qid,
                path: path.clone(),
                mode: None,
            },
        );

        self.store
            .open(&path, mode)
            .await
            .map_err(|_| error::Error::proto(errstr::ECANNOT_OPEN))?;
        if let Some(entry) = self.fids.get_mut(&fid) {
            entry.mode = Some(mode);
        }

        Ok(Fcall::Rcreate { qid, iounit: 0 })
    }

    async fn read(&mut self, fid: u32, offset: u64, count: u32) -> Result<Fcall> {
        let path = {
            let entry = self.entry(fid)?;
            if entry.mode.is_none() {
                return Err(error::Error::proto(errstr::EBADF_USE));
            }
            entry.path.clone()
        };

        let count = count.min(self.msize.saturating_sub(IOHDRSZ));
        let data = self.store.read(&path, offset, count).await?;

        Ok(Fcall::Rread { data: Data(data) })
    }

    async fn write(&mut self, fid: u32, offset: u64, data: &Data) -> Result<Fcall> {
        let path = {
            let entry = self.entry(fid)?;
            if entry.mode.is_none() {
                return Err(error::Error::proto(errstr::EBADF_USE));
            }
            entry.path.clone()
        };

        let count = self.store.write(&path, offset, &data.0).await?;
        if count as usize != data.0.len() {
            return Err(error::Error::proto(errstr::EWRITE_FAILED));
        }

        Ok(Fcall::Rwrite { count })
    }

    async fn clunk(&mut self, fid: u32) -> Result<Fcall> {
        self.fids
            .remove(&fid)
            .ok_or_else(|| error::Error::proto(errstr::EBADF))?;

        // clunking the attach root ends the session once the reply is out
        if self.root_fid == Some(fid) {
            self.root_fid = None;
            self.hangup = true;
        }

        Ok(Fcall::Rclunk)
    }

    async fn remove(&mut self, fid: u32) -> Result<Fcall> {
        // the fid is released whether or not the remove succeeds
        let entry = self
            .fids
            .remove(&fid)
            .ok_or_else(|| error::Error::proto(errstr::EBADF))?;

        // removing the root releases it just like a clunk would; a stale
        // root_fid here would end the session when the number is reused
        if self.root_fid == Some(fid) {
            self.root_fid = None;
            self.hangup = true;
        }

        self.store.remove(&entry.path).await?;

        Ok(Fcall::Rremove)
    }

    async fn stat(&mut self, fid: u32) -> Result<Fcall> {
        let path = self.entry(fid)?.path.clone();
        let stat = self
            .store
            .stat(&path)
            .await
            .map_err(|_| error::Error::proto(errstr::ENOENT))?;

        Ok(Fcall::Rstat { stat })
    }

    async fn wstat(&mut self, fid: u32, stat: &Stat) -> Result<Fcall> {
        let path = self.entry(fid)?.path.clone();

        if let Some(renamed) = self.store.wstat(&path, stat).await? {
            if let Some(entry) = self.fids.get_mut(&fid) {
                entry.path = renamed;
            }
        }

        Ok(Fcall::Rwstat)
    }
}

/// Run one framed session over a connected byte stream until the peer
/// hangs up, clunks its root fid, or poisons the stream.
pub(crate) async fn serve_session<S, R, W>(store: Arc<S>, reader: R, writer: W) -> Result<()>
where
    S: Store,
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut rx = FramedRead::new(reader, serialize::frame_codec());
    let mut tx = FramedWrite::new(writer, serialize::frame_codec());
    let mut session = Session::new(store);

    while let Some(frame) = rx.next().await {
        let frame = frame?;

        // A type byte outside the known set is answered rather than
        // fatal; a known message that fails to parse leaves no way to
        // resynchronize, so it drops the connection.
        let reply = if frame.len() >= 3 && MsgType::from_u8(frame[0]).is_none() {
            let tag = u16::from_le_bytes([frame[1], frame[2]]);
            Msg {
                tag,
                body: Fcall::Rerror {
                    ename: errstr::EUNSUPPORTED.to_owned(),
                },
            }
        } else {
            let msg = serialize::read_msg(&mut frame.reader())?;
            session.handle(msg).await
        };

        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, &reply)?;
        tx.send(writer.into_inner().freeze()).await?;

        if session.hangup() {
            break;
        }
    }

    Ok(())
}

/// Serve `store` on an already-bound listener, one session task per
/// accepted connection. The store is shared across connections.
pub async fn srv_listener<S>(store: S, listener: TcpListener) -> Result<()>
where
    S: Store + 'static,
{
    let store = Arc::new(store);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let store = store.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = serve_session(store, readhalf, writehalf).await {
                error!("session error: {}", e);
            }
        });
    }
}

/// Bind `addr` (`host:port`) and serve `store` on it.
pub async fn srv_async<S>(store: S, addr: &str) -> Result<()>
where
    S: Store + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    srv_listener(store, listener).await
}
