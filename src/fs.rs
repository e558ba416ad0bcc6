//! The trait that defines a filesystem backend.
//!
//! The method engine consumes this capability set and nothing more:
//! typed nodes, streaming reads with byte ranges, random-access writes,
//! atomic subtree copy/move/delete, and a dead-property store. The
//! in-memory [`MemFs`](crate::memfs::MemFs) is one implementation; a
//! disk- or database-backed store is another.
use std::fmt::Debug;
use std::time::SystemTime;

use bytes::Bytes;
use dyn_clone::DynClone;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use http::StatusCode;

use crate::davpath::DavPath;

/// Errors a filesystem implementation can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    GeneralFailure,
    /// Tried to create something that already exists.
    Exists,
    NotFound,
    Forbidden,
    /// Member listing on something that is not a collection.
    NotACollection,
}

pub type FsResult<T> = std::result::Result<T, FsError>;

/// Future returned by the filesystem methods.
pub type FsFuture<'a, T> = BoxFuture<'a, FsResult<T>>;

/// Lazy byte stream, as returned by `read_stream`.
pub type FsStream<T> = BoxStream<'static, FsResult<T>>;

/// The two kinds of nodes in the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Collection,
}

/// Inclusive byte range of a ranged read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end:   u64,
}

/// Target of a random-access write.
///
/// The incoming bytes are spliced in at `start..=end`; if the file is
/// missing or shorter, it is zero-padded up to `start` (and to `total`
/// when the complete length is known).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRange {
    pub start: u64,
    pub end:   u64,
    pub total: Option<u64>,
}

/// A dead property: a qualified name plus its verbatim XML value.
#[derive(Debug, Clone)]
pub struct DavProp {
    pub name:      String,
    pub prefix:    Option<String>,
    pub namespace: Option<String>,
    pub xml:       Option<Vec<u8>>,
}

/// Directory entry returned by `members`.
#[derive(Debug)]
pub struct DavMember {
    pub name: Vec<u8>,
    pub meta: Box<dyn DavMetaData>,
}

/// Metadata of a node.
pub trait DavMetaData: Debug + Send + Sync {
    fn len(&self) -> u64;
    fn kind(&self) -> NodeKind;
    /// Opaque tag, regenerated on every content write.
    fn etag(&self) -> String;
    fn modified(&self) -> SystemTime;
    fn created(&self) -> SystemTime;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn is_collection(&self) -> bool {
        self.kind() == NodeKind::Collection
    }
    fn is_file(&self) -> bool {
        self.kind() == NodeKind::File
    }
}

/// Write handle returned by `open_write`.
///
/// Chunks are appended at the write position; `commit` finalizes the
/// write, bumps the modification time, regenerates the ETag and returns
/// the fresh metadata. Dropping the handle without committing leaves
/// whatever was written so far, but no metadata update takes place.
pub trait DavFile: Debug + Send {
    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<'_, ()>;
    fn commit(&mut self) -> FsFuture<'_, Box<dyn DavMetaData>>;
}

/// The filesystem contract the method engine consumes.
///
/// Implementations must be safe under concurrent calls for distinct
/// paths; same-path body I/O is serialized by the engine's stream locks.
pub trait DavFileSystem: Debug + Send + Sync + DynClone {
    /// What, if anything, lives at this path.
    fn node_type<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Option<NodeKind>>;

    /// Metadata of the node at this path.
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>>;

    /// Create an empty node. Missing parent collections are created
    /// along the way.
    fn create<'a>(&'a self, path: &'a DavPath, kind: NodeKind) -> FsFuture<'a, ()>;

    /// Remove a node; recursive for collections.
    fn remove<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()>;

    /// Duplicate a subtree. Dead properties come along; every copied
    /// node gets a fresh ETag and `created = now`.
    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()>;

    /// Move a subtree, atomically with respect to concurrent readers.
    /// Dead properties come along; ETags are regenerated.
    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()>;

    /// Direct children of a collection.
    fn members<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<DavMember>>;

    /// Lazy content stream, optionally limited to a byte range the
    /// caller has validated against the current size.
    fn read_stream<'a>(
        &'a self,
        path: &'a DavPath,
        range: Option<ByteRange>,
    ) -> FsFuture<'a, FsStream<Bytes>>;

    /// Open for writing, creating the file (and parent collections) if
    /// absent. Without a range the content is replaced; with one, the
    /// incoming bytes are spliced in per [`WriteRange`].
    fn open_write<'a>(
        &'a self,
        path: &'a DavPath,
        range: Option<WriteRange>,
    ) -> FsFuture<'a, Box<dyn DavFile>>;

    /// Apply a set of dead-property changes atomically. `true` means
    /// set, `false` means remove; the per-property result statuses are
    /// reported back in the order given.
    fn patch_props<'a>(
        &'a self,
        path: &'a DavPath,
        patch: Vec<(bool, DavProp)>,
    ) -> FsFuture<'a, Vec<(StatusCode, DavProp)>>;

    /// Look up one dead property value.
    fn get_prop<'a>(&'a self, path: &'a DavPath, prop: &'a DavProp) -> FsFuture<'a, Vec<u8>>;

    /// All dead properties of a node, with or without their values.
    fn list_props<'a>(
        &'a self,
        path: &'a DavPath,
        with_content: bool,
    ) -> FsFuture<'a, Vec<DavProp>>;

    /// Convenience: does the path map to a node.
    fn exists<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, bool> {
        Box::pin(async move { Ok(self.node_type(path).await?.is_some()) })
    }

    /// Convenience: set a single dead property.
    fn set_prop<'a>(&'a self, path: &'a DavPath, prop: DavProp) -> FsFuture<'a, ()> {
        Box::pin(async move {
            self.patch_props(path, vec![(true, prop)]).await?;
            Ok(())
        })
    }

    /// Convenience: remove a single dead property.
    fn remove_prop<'a>(&'a self, path: &'a DavPath, prop: DavProp) -> FsFuture<'a, ()> {
        Box::pin(async move {
            self.patch_props(path, vec![(false, prop)]).await?;
            Ok(())
        })
    }
}

dyn_clone::clone_trait_object!(DavFileSystem);

impl std::error::Error for FsError {}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
