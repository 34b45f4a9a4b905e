// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire ABI shared between task servers and the host runtime's workers.
//!
//! Every message on the transport is one of:
//!
//! - a fixed-layout record, shipped as its raw bytes (`zerocopy` derives);
//!   these are the hot-path responses a blocked worker is waiting on, or
//!
//! - a `hubpack`-serialized header, optionally followed in the same message
//!   by a binary data blob (subscript bytes, payload bytes, packed lists).
//!   `hubpack::deserialize` returns the unconsumed remainder of the buffer,
//!   which *is* the blob.
//!
//! The message tag space is closed: one tag per RPC kind plus the response
//! and sync tags. Tag values and `Code` wire values are pinned by unit
//! tests at the bottom of this file; changing them breaks every deployed
//! peer, so don't.

use byteorder::{ByteOrder, LittleEndian};
use hubpack::SerializedSize;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// World rank of a process (worker or server).
pub type Rank = i32;

/// Sentinel rank: "no rank" / "any rank" depending on context. As a put
/// target it means the task is untargeted.
pub const RANK_NULL: Rank = -1;

/// Globally unique datum id. Non-zero; negative ids are legal and wrap
/// into the server range when located.
pub type DataId = i64;

/// Sentinel id: "no datum" in requests where the server assigns the id.
pub const DATA_ID_NULL: DataId = 0;

/// Task type index, in `[0, types)` for a configured type count.
pub type WorkType = i32;

/// Upper bound on task payloads and datum values, and the size of each
/// server's scratch transfer buffer.
pub const PAYLOAD_MAX: usize = 1024 * 1024;

/// Payloads at most this long may ride inside the `Put` message itself;
/// longer ones are shipped separately on [`Tag::Work`] after the server
/// answers with a destination.
pub const INLINE_DATA_MAX: usize = 1024;

/// Upper bound on subscript keys.
pub const SUBSCRIPT_MAX: usize = 1024;

/// Message tags. Disjoint from user-level tags by construction: the
/// transport namespace for this protocol is owned entirely by this enum.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u16)]
pub enum Tag {
    Put = 1,
    Get = 2,
    Iget = 3,
    Create = 4,
    Multicreate = 5,
    Exists = 6,
    Store = 7,
    Retrieve = 8,
    Enumerate = 9,
    Subscribe = 10,
    RefcountIncr = 11,
    InsertAtomic = 12,
    ContainerReference = 13,
    ContainerSize = 14,
    ContainerTypeof = 15,
    Typeof = 16,
    Unique = 17,
    Lock = 18,
    Unlock = 19,
    CheckIdle = 20,
    ShutdownWorker = 21,
    ShutdownServer = 22,
    Fail = 23,
    Steal = 24,
    Notify = 25,
    Rule = 26,
    SyncRequest = 27,
    SyncResponse = 28,
    Response = 29,
    ResponseGet = 30,
    ResponsePut = 31,
    ResponseSteal = 32,
    ResponseStealCount = 33,
    Work = 34,
}

impl TryFrom<u16> for Tag {
    type Error = ();

    fn try_from(x: u16) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::Put),
            2 => Ok(Self::Get),
            3 => Ok(Self::Iget),
            4 => Ok(Self::Create),
            5 => Ok(Self::Multicreate),
            6 => Ok(Self::Exists),
            7 => Ok(Self::Store),
            8 => Ok(Self::Retrieve),
            9 => Ok(Self::Enumerate),
            10 => Ok(Self::Subscribe),
            11 => Ok(Self::RefcountIncr),
            12 => Ok(Self::InsertAtomic),
            13 => Ok(Self::ContainerReference),
            14 => Ok(Self::ContainerSize),
            15 => Ok(Self::ContainerTypeof),
            16 => Ok(Self::Typeof),
            17 => Ok(Self::Unique),
            18 => Ok(Self::Lock),
            19 => Ok(Self::Unlock),
            20 => Ok(Self::CheckIdle),
            21 => Ok(Self::ShutdownWorker),
            22 => Ok(Self::ShutdownServer),
            23 => Ok(Self::Fail),
            24 => Ok(Self::Steal),
            25 => Ok(Self::Notify),
            26 => Ok(Self::Rule),
            27 => Ok(Self::SyncRequest),
            28 => Ok(Self::SyncResponse),
            29 => Ok(Self::Response),
            30 => Ok(Self::ResponseGet),
            31 => Ok(Self::ResponsePut),
            32 => Ok(Self::ResponseSteal),
            33 => Ok(Self::ResponseStealCount),
            34 => Ok(Self::Work),
            _ => Err(()),
        }
    }
}

/// Status taxonomy for every operation in the protocol.
///
/// `Nothing` is ordinary control flow ("not available"), not an error.
/// `Rejected` is retryable when it comes from the sync handshake or a
/// full pending buffer, and final for double-writes.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum Code {
    Success,
    Nothing,
    Rejected,
    NotFound,
    Invalid,
    Oom,
    Shutdown,
    Error,
}

impl Code {
    /// Wire value used inside fixed-layout records.
    pub fn as_wire(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Nothing => 1,
            Self::Rejected => 2,
            Self::NotFound => 3,
            Self::Invalid => 4,
            Self::Oom => 5,
            Self::Shutdown => 6,
            Self::Error => 7,
        }
    }

    pub fn from_wire(x: i32) -> Option<Self> {
        match x {
            0 => Some(Self::Success),
            1 => Some(Self::Nothing),
            2 => Some(Self::Rejected),
            3 => Some(Self::NotFound),
            4 => Some(Self::Invalid),
            5 => Some(Self::Oom),
            6 => Some(Self::Shutdown),
            7 => Some(Self::Error),
            _ => None,
        }
    }
}

/// How strongly a task is bound to its target.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum Strictness {
    /// Only the target (or its host, for node accuracy) may run it.
    Hard,
    /// The target is preferred; anyone may steal/run it.
    Soft,
}

/// What a task's target rank designates.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum Accuracy {
    /// Exactly the named rank.
    Rank,
    /// Any worker on the named rank's host.
    Node,
}

/// Placement policy for newly allocated datum ids.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum Placement {
    /// On the caller's home server.
    Default,
    /// Rotate across servers.
    Random,
    /// Always on the server handling the create.
    Local,
}

/// Type of a datum or of a container key/element.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum DataType {
    Integer,
    Float,
    Str,
    Blob,
    Ref,
    Container,
    Multiset,
    Struct,
}

impl DataType {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Integer => 0,
            Self::Float => 1,
            Self::Str => 2,
            Self::Blob => 3,
            Self::Ref => 4,
            Self::Container => 5,
            Self::Multiset => 6,
            Self::Struct => 7,
        }
    }

    pub fn from_u8(x: u8) -> Option<Self> {
        match x {
            0 => Some(Self::Integer),
            1 => Some(Self::Float),
            2 => Some(Self::Str),
            3 => Some(Self::Blob),
            4 => Some(Self::Ref),
            5 => Some(Self::Container),
            6 => Some(Self::Multiset),
            7 => Some(Self::Struct),
            _ => None,
        }
    }

    /// True for the set-once single-slot types.
    pub fn is_scalar(self) -> bool {
        !matches!(self, Self::Container | Self::Multiset | Self::Struct)
    }
}

/// A pair of reference-count deltas, applied together.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct Refcounts {
    pub read: i32,
    pub write: i32,
}

impl Refcounts {
    pub const NONE: Self = Self { read: 0, write: 0 };
    pub const READ_ONE: Self = Self { read: 1, write: 0 };
    pub const WRITE_ONE: Self = Self { read: 0, write: 1 };

    pub fn is_none(self) -> bool {
        self.read == 0 && self.write == 0
    }
}

//
// Fixed-layout response records. A blocked worker receives these as raw
// bytes; all fields are four-byte so there is no padding to worry about.
//

/// Answer to `Get`/`Iget`, also used to hand dispatched work to a waiting
/// worker and to release workers at shutdown.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, KnownLayout,
    Immutable,
)]
#[repr(C)]
pub struct GetResponse {
    /// `Code` wire value: Success (work follows), Nothing (iget only), or
    /// Shutdown.
    pub code: i32,
    /// Rank the task's result should be addressed to.
    pub answer_rank: i32,
    /// Rank that will send the payload on [`Tag::Work`].
    pub payload_source: i32,
    pub work_type: i32,
    pub length: u32,
    pub parallelism: i32,
}

const_assert_eq!(core::mem::size_of::<GetResponse>(), 24);

impl GetResponse {
    pub fn shutdown() -> Self {
        Self {
            code: Code::Shutdown.as_wire(),
            answer_rank: RANK_NULL,
            payload_source: RANK_NULL,
            work_type: -1,
            length: 0,
            parallelism: 0,
        }
    }

    pub fn nothing(payload_source: Rank) -> Self {
        Self {
            code: Code::Nothing.as_wire(),
            answer_rank: RANK_NULL,
            payload_source,
            work_type: -1,
            length: 0,
            parallelism: 0,
        }
    }
}

/// Answer to `Put`: where to ship the payload. `dest == RANK_NULL` means
/// the server already has the payload (or the put failed) and the put is
/// complete.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, KnownLayout,
    Immutable,
)]
#[repr(C)]
pub struct PutResponse {
    /// `Code` wire value.
    pub code: i32,
    pub dest: i32,
}

const_assert_eq!(core::mem::size_of::<PutResponse>(), 8);

impl PutResponse {
    pub fn done() -> Self {
        Self {
            code: Code::Success.as_wire(),
            dest: RANK_NULL,
        }
    }

    pub fn to(dest: Rank) -> Self {
        Self {
            code: Code::Success.as_wire(),
            dest,
        }
    }

    pub fn error(code: Code) -> Self {
        Self {
            code: code.as_wire(),
            dest: RANK_NULL,
        }
    }
}

/// Answer to `SyncRequest`: 1 = accepted, 0 = rejected (retry later).
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, KnownLayout,
    Immutable,
)]
#[repr(C)]
pub struct SyncAck {
    pub accept: i32,
}

//
// hubpack headers, request side.
//

/// `Put`: submit one task. If `has_inline`, the payload rides in this
/// message after the header; otherwise the caller waits for
/// [`PutResponse`] and ships the payload to the rank named there on
/// [`Tag::Work`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct PutHeader {
    pub work_type: WorkType,
    pub putter: Rank,
    pub priority: i32,
    pub answer: Rank,
    /// `RANK_NULL` for untargeted work.
    pub target: Rank,
    pub strictness: Strictness,
    pub accuracy: Accuracy,
    pub parallelism: i32,
    pub length: u32,
    pub has_inline: bool,
}

/// `Get` / `Iget`: request one task of the given type.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct GetHeader {
    pub work_type: WorkType,
}

/// Creation-time datum properties.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct CreateProps {
    pub read_refs: i32,
    pub write_refs: i32,
    /// Never freed, even at zero refcounts.
    pub permanent: bool,
    /// Debug symbol id; 0 = none.
    pub symbol: u32,
    pub placement: Placement,
}

impl Default for CreateProps {
    fn default() -> Self {
        Self {
            read_refs: 1,
            write_refs: 1,
            permanent: false,
            symbol: 0,
            placement: Placement::Default,
        }
    }
}

/// Element typing for compound datum creation.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum CreateExtras {
    None,
    Container { key: DataType, val: DataType },
    Multiset { elem: DataType },
    Struct { struct_type: u32 },
}

/// `Create`: make one datum. `id == DATA_ID_NULL` asks the server to
/// assign one.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct CreateHeader {
    pub id: DataId,
    pub dtype: DataType,
    pub props: CreateProps,
    pub extras: CreateExtras,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct CreateResponse {
    pub code: Code,
    pub id: DataId,
}

/// `Multicreate`: the header counts [`CreateHeader`]s concatenated in the
/// blob; the response blob carries `count` assigned ids, each 8 bytes LE.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct MulticreateHeader {
    pub count: u32,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct MulticreateResponse {
    pub code: Code,
    pub count: u32,
}

/// `Store`: blob = subscript bytes (`sub_len`) then value bytes
/// (`length`).
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct StoreHeader {
    pub id: DataId,
    /// 0 = whole-datum store (scalars only).
    pub sub_len: u32,
    pub dtype: DataType,
    /// Applied to the stored datum with the write.
    pub decr: Refcounts,
    /// Transferred to references embedded in the value.
    pub store_refs: Refcounts,
    pub length: u32,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct StoreResponse {
    pub code: Code,
    pub close_notifies: u32,
    pub ref_notifies: u32,
}

/// `Retrieve`: blob = subscript bytes. `decr` lowers the datum's own
/// counts; `acquire` raises the counts of a retrieved reference, atomically
/// with the read.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct RetrieveHeader {
    pub id: DataId,
    pub sub_len: u32,
    pub decr: Refcounts,
    pub acquire: Refcounts,
}

/// Response blob = value bytes.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct RetrieveResponse {
    pub code: Code,
    pub dtype: DataType,
    pub length: u32,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct ExistsHeader {
    pub id: DataId,
    pub sub_len: u32,
    pub decr: Refcounts,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct ExistsResponse {
    pub code: Code,
    pub exists: bool,
}

/// `Subscribe`: ask to be notified when the datum (or subscript) closes.
/// The notification arrives as a targeted task of `work_type` whose
/// payload is [`notify_payload`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct SubscribeHeader {
    pub id: DataId,
    pub sub_len: u32,
    pub work_type: WorkType,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct SubscribeResponse {
    pub code: Code,
    /// `false`: already closed, no notification will come.
    pub subscribed: bool,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct RefcountHeader {
    pub id: DataId,
    pub change: Refcounts,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct RefcountResponse {
    pub code: Code,
    pub close_notifies: u32,
    pub ref_notifies: u32,
}

/// `InsertAtomic`: create-if-absent for one container/struct slot. Blob =
/// subscript.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct InsertAtomicHeader {
    pub id: DataId,
    pub sub_len: u32,
    /// Applied to the existing value's embedded reference when returned.
    pub acquire: Refcounts,
    pub return_value: bool,
}

/// Response blob = existing value bytes when `value_present`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct InsertAtomicResponse {
    pub code: Code,
    pub created: bool,
    pub value_present: bool,
    pub dtype: DataType,
    pub length: u32,
}

/// `ContainerReference`: when `id[sub]` is set, store its value into
/// `(ref_id, ref_sub)`; otherwise remember the reference and resolve it on
/// insert. Blob = subscript bytes then ref-subscript bytes.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct ContainerRefHeader {
    pub id: DataId,
    pub sub_len: u32,
    pub ref_id: DataId,
    pub ref_sub_len: u32,
    pub ref_type: DataType,
    /// Refcounts transferred to the referenced value when resolved.
    pub transfer: Refcounts,
    pub decr: Refcounts,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct ContainerSizeHeader {
    pub id: DataId,
    pub decr: Refcounts,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct ContainerSizeResponse {
    pub code: Code,
    pub size: i64,
}

/// `Enumerate`: slice `[offset, offset+count)` of a container. Response
/// blob = packed subscripts (if requested) then packed members (if
/// requested); both use [`pack_bytes`] framing, members prefixed with a
/// type byte.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct EnumerateHeader {
    pub id: DataId,
    /// Negative count = "through the end".
    pub count: i32,
    pub offset: i32,
    pub want_subscripts: bool,
    pub want_members: bool,
    pub decr: Refcounts,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct EnumerateResponse {
    pub code: Code,
    pub actual: u32,
    pub subscripts_len: u32,
    pub members_len: u32,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct TypeofHeader {
    pub id: DataId,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct TypeofResponse {
    pub code: Code,
    pub dtype: DataType,
}

/// Answer to `ContainerTypeof`: both halves of a container's typing —
/// the subscript key type and the member value type. Multisets have no
/// keys; both fields report the element type for them.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct ContainerTypeofResponse {
    pub code: Code,
    pub key_type: DataType,
    pub val_type: DataType,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct UniqueResponse {
    pub code: Code,
    pub id: DataId,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct LockHeader {
    pub id: DataId,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct LockResponse {
    pub code: Code,
    pub granted: bool,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct UnlockHeader {
    pub id: DataId,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct SimpleResponse {
    pub code: Code,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct IdleResponse {
    pub idle: bool,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct FailHeader {
    pub exit_code: i32,
}

/// `Steal` request: blob = `type_count` wait counts, each 4 bytes LE.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct StealHeader {
    pub max_memory: i64,
    pub type_count: u32,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct StealCountResponse {
    pub count: u32,
}

/// `Notify`: a datum (or subscript) on the sender's side closed and this
/// server subscribed to it. Blob = subscript bytes. Also carried
/// piggy-backed in [`SyncHeader::Notify`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct NotifyHeader {
    pub id: DataId,
    pub sub_len: u32,
}

/// Kind-discriminated sync handshake header. Small operations piggy-back
/// their arguments here so acceptance completes them in one round trip;
/// `Put`/`Store`/`Steal` syncs are followed by the ordinary RPC from the
/// initiator. Blob = subscript bytes for `Subscribe`/`Notify`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub enum SyncHeader {
    /// Follow-up: a `Put` RPC.
    Put,
    /// Follow-up: a `Store` RPC.
    Store,
    /// Follow-up: a `Steal` RPC.
    Steal,
    /// Piggy-backed engine subscription to `id` (or `id[sub]`).
    Subscribe { id: DataId, sub_len: u32, work_type: WorkType },
    /// Piggy-backed close notification for `id` (or `id[sub]`).
    Notify { id: DataId, sub_len: u32 },
    /// Piggy-backed refcount change.
    Refcount { id: DataId, change: Refcounts },
    /// Follow-up: one generic RPC (e.g. `CheckIdle`).
    Generic,
}

/// `Rule` (data-dependent put): blob = name bytes, then `n_ids` input ids
/// (8 bytes LE each), then `n_id_subs` of (8-byte LE id, [`pack_bytes`]
/// subscript), then `length` payload bytes.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct RuleHeader {
    pub name_len: u32,
    pub n_ids: u32,
    pub n_id_subs: u32,
    pub work_type: WorkType,
    pub priority: i32,
    pub answer: Rank,
    pub target: Rank,
    pub strictness: Strictness,
    pub accuracy: Accuracy,
    pub parallelism: i32,
    pub length: u32,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct RuleResponse {
    pub code: Code,
    /// The inputs were already satisfied at submission.
    pub ready: bool,
}

//
// Encoding helpers.
//

/// Error at the wire codec layer. Always a peer bug or truncation, never
/// retryable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WireError;

impl From<hubpack::Error> for WireError {
    fn from(_: hubpack::Error) -> Self {
        WireError
    }
}

/// Serializes a header into a fresh message buffer.
pub fn encode<T: Serialize + SerializedSize>(msg: &T) -> Vec<u8> {
    encode_with_blob(msg, &[])
}

/// Serializes a header and appends `blob` in the same message.
pub fn encode_with_blob<T: Serialize + SerializedSize>(
    msg: &T,
    blob: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; T::MAX_SIZE];
    let n = hubpack::serialize(&mut buf, msg)
        .expect("buffer sized to MAX_SIZE cannot be short");
    buf.truncate(n);
    buf.extend_from_slice(blob);
    buf
}

/// Deserializes a header, returning it and the trailing blob.
pub fn decode<'a, T: DeserializeOwned + SerializedSize>(
    bytes: &'a [u8],
) -> Result<(T, &'a [u8]), WireError> {
    let (msg, rest) = hubpack::deserialize(bytes)?;
    Ok((msg, rest))
}

/// Appends one length-prefixed byte string to `out`.
pub fn pack_bytes(out: &mut Vec<u8>, item: &[u8]) {
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, item.len() as u32);
    out.extend_from_slice(&len);
    out.extend_from_slice(item);
}

/// Splits one length-prefixed byte string off the front of `input`.
pub fn unpack_bytes(input: &[u8]) -> Option<(&[u8], &[u8])> {
    if input.len() < 4 {
        return None;
    }
    let len = LittleEndian::read_u32(&input[..4]) as usize;
    let rest = &input[4..];
    if rest.len() < len {
        return None;
    }
    Some((&rest[..len], &rest[len..]))
}

/// Appends one 8-byte LE datum id to `out`.
pub fn pack_id(out: &mut Vec<u8>, id: DataId) {
    let mut b = [0u8; 8];
    LittleEndian::write_i64(&mut b, id);
    out.extend_from_slice(&b);
}

/// Splits one 8-byte LE datum id off the front of `input`.
pub fn unpack_id(input: &[u8]) -> Option<(DataId, &[u8])> {
    if input.len() < 8 {
        return None;
    }
    Some((LittleEndian::read_i64(&input[..8]), &input[8..]))
}

//
// Scalar datum value encodings. Integers, floats and references are
// fixed 8-byte little-endian; strings and blobs are their bytes.
//

pub fn integer_bytes(v: i64) -> [u8; 8] {
    let mut b = [0u8; 8];
    LittleEndian::write_i64(&mut b, v);
    b
}

pub fn integer_from_bytes(b: &[u8]) -> Option<i64> {
    if b.len() != 8 {
        return None;
    }
    Some(LittleEndian::read_i64(b))
}

pub fn float_bytes(v: f64) -> [u8; 8] {
    let mut b = [0u8; 8];
    LittleEndian::write_f64(&mut b, v);
    b
}

pub fn float_from_bytes(b: &[u8]) -> Option<f64> {
    if b.len() != 8 {
        return None;
    }
    Some(LittleEndian::read_f64(b))
}

pub fn id_bytes(v: DataId) -> [u8; 8] {
    integer_bytes(v)
}

pub fn id_from_bytes(b: &[u8]) -> Option<DataId> {
    integer_from_bytes(b)
}

//
// Close-notification task payloads.
//

/// Builds the payload of a close-notification task: `close <id>` with the
/// raw subscript bytes appended after a space when subscript-scoped.
pub fn notify_payload(id: DataId, sub: Option<&[u8]>) -> Vec<u8> {
    let mut p = format!("close {id}").into_bytes();
    if let Some(sub) = sub {
        p.push(b' ');
        p.extend_from_slice(sub);
    }
    p
}

/// Parses a close-notification payload back into id and subscript.
pub fn parse_notify_payload(payload: &[u8]) -> Option<(DataId, Option<&[u8]>)> {
    let rest = payload.strip_prefix(b"close ")?;
    let digits_end = rest
        .iter()
        .position(|b| !(b.is_ascii_digit() || *b == b'-'))
        .unwrap_or(rest.len());
    let id: DataId =
        std::str::from_utf8(&rest[..digits_end]).ok()?.parse().ok()?;
    match rest.get(digits_end) {
        None => Some((id, None)),
        Some(b' ') => Some((id, Some(&rest[digits_end + 1..]))),
        Some(_) => None,
    }
}
