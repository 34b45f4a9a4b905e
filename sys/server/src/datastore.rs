// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The in-memory store of typed, set-once data items.
//!
//! Each server stores the datums whose ids are home to it. A datum is a
//! typed value (scalar, container, multiset, or struct), a pair of
//! reference counts, and a subscriber set. Scalars are set once;
//! container entries and struct fields are individually set once.
//!
//! The life of a datum:
//!
//! - created with initial read/write refcounts;
//! - written, with refcount deltas applied atomically with each write;
//! - **closed** when the write refcount reaches zero — every subscriber
//!   is owed exactly one notification, and pending cross-datum
//!   references resolve;
//! - freed when both refcounts reach zero, unless created permanent.
//!
//! The write refcount is monotonically non-increasing after creation,
//! and neither count may go negative; violating deltas are `Invalid`.
//!
//! Mutating operations return a [`Notifications`] bundle rather than
//! delivering anything themselves: delivery (local work-unit injection,
//! cross-server sync) is the notification module's business, and may
//! recursively produce further bundles.
//!
//! Subscripts: container subscripts are opaque byte keys; struct
//! subscripts are `.`-separated field-index paths (`"3.1.0"`) resolved
//! against the registered struct types.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BTreeMap, HashMap};

use abi::{
    Code, CreateExtras, CreateProps, DataId, DataType, Rank, Refcounts,
    WorkType, DATA_ID_NULL,
};
use bitflags::bitflags;

use crate::StructType;

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct DatumFlags: u8 {
        /// Write refcount has reached zero and close notifications have
        /// been emitted. Guards exactly-once close.
        const CLOSED = 1 << 0;
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DataError {
    NotFound,
    /// The datum exists but the requested value/subscript is not set.
    NotSet,
    /// Create of an id that is already present.
    Exists,
    /// Store into an already-set slot.
    DoubleWrite,
    /// Type mismatch between operation and datum.
    WrongType,
    /// Malformed subscript, unregistered struct type, bad extras.
    Invalid,
    /// A refcount delta would go negative or raise the write count.
    BadRefcount,
}

impl DataError {
    pub fn code(&self) -> Code {
        match self {
            Self::NotFound | Self::NotSet => Code::NotFound,
            Self::DoubleWrite => Code::Rejected,
            Self::Exists
            | Self::WrongType
            | Self::Invalid
            | Self::BadRefcount => Code::Invalid,
        }
    }
}

/// A close owed to a subscriber.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseNotif {
    pub rank: Rank,
    pub work_type: WorkType,
    pub id: DataId,
    pub sub: Option<Vec<u8>>,
}

/// A store owed to a datum that referenced a now-known value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefStore {
    pub id: DataId,
    pub sub: Option<Vec<u8>>,
    pub dtype: DataType,
    pub value: Vec<u8>,
    /// Applied to references embedded in `value` when it lands.
    pub store_refs: Refcounts,
}

/// A refcount change owed to a (possibly remote) datum.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RcOp {
    pub id: DataId,
    pub change: Refcounts,
}

/// Side effects of a mutating operation, to be delivered by the caller.
#[derive(Clone, Debug, Default)]
pub struct Notifications {
    pub closes: Vec<CloseNotif>,
    pub refs: Vec<RefStore>,
    pub rc_ops: Vec<RcOp>,
}

impl Notifications {
    pub fn is_empty(&self) -> bool {
        self.closes.is_empty() && self.refs.is_empty() && self.rc_ops.is_empty()
    }

    pub fn merge(&mut self, mut other: Notifications) {
        self.closes.append(&mut other.closes);
        self.refs.append(&mut other.refs);
        self.rc_ops.append(&mut other.rc_ops);
    }
}

#[derive(Clone, Debug)]
struct Subscriber {
    rank: Rank,
    work_type: WorkType,
    /// `None` = whole-datum close; `Some` = one subscript's assignment.
    sub: Option<Vec<u8>>,
}

/// A cross-datum reference waiting for one slot's value.
#[derive(Clone, Debug)]
struct PendingRef {
    ref_id: DataId,
    ref_sub: Option<Vec<u8>>,
    ref_type: DataType,
    transfer: Refcounts,
}

/// One set-once slot of a container or struct.
#[derive(Clone, Debug, Default)]
struct Slot {
    value: Option<Vec<u8>>,
    pending_refs: Vec<PendingRef>,
}

#[derive(Clone, Debug)]
enum Value {
    Scalar(Option<Vec<u8>>),
    Container {
        key_type: DataType,
        val_type: DataType,
        entries: BTreeMap<Vec<u8>, Slot>,
    },
    Multiset {
        elem_type: DataType,
        elems: Vec<Vec<u8>>,
    },
    Struct {
        struct_type: u32,
        fields: BTreeMap<Vec<u8>, Slot>,
    },
}

#[derive(Clone, Debug)]
struct Datum {
    dtype: DataType,
    value: Value,
    read_refs: i64,
    write_refs: i64,
    /// Creation-time properties: permanence, placement policy, debug
    /// symbol. Permanence is consulted on every free decision.
    props: CreateProps,
    flags: DatumFlags,
    lock: Option<Rank>,
    subscribers: Vec<Subscriber>,
}

impl Datum {
    fn is_closed(&self) -> bool {
        self.flags.contains(DatumFlags::CLOSED)
    }

    fn slot(&self, sub: &[u8]) -> Option<&Slot> {
        match &self.value {
            Value::Container { entries, .. } => entries.get(sub),
            Value::Struct { fields, .. } => fields.get(sub),
            _ => None,
        }
    }

    fn slot_ensure(&mut self, sub: &[u8]) -> &mut Slot {
        match &mut self.value {
            Value::Container { entries, .. } => {
                entries.entry(sub.to_vec()).or_default()
            }
            Value::Struct { fields, .. } => {
                fields.entry(sub.to_vec()).or_default()
            }
            _ => unreachable!("slot on non-compound datum"),
        }
    }
}

pub struct DataStore {
    map: HashMap<DataId, Datum>,
    struct_types: Vec<StructType>,
    /// Next id this server will mint; strides by the server count so
    /// every minted id is home here.
    next_id: DataId,
    stride: i64,
}

impl DataStore {
    pub fn new(
        server_number: i32,
        servers: i32,
        struct_types: Vec<StructType>,
    ) -> Self {
        let stride = servers as i64;
        // Smallest positive id congruent to our server number.
        let first = if server_number == 0 {
            stride
        } else {
            server_number as i64
        };
        Self {
            map: HashMap::new(),
            struct_types,
            next_id: first,
            stride,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Mints a fresh id home to this server.
    pub fn unique(&mut self) -> DataId {
        let id = self.next_id;
        self.next_id += self.stride;
        id
    }

    pub fn create(
        &mut self,
        id: DataId,
        dtype: DataType,
        props: CreateProps,
        extras: CreateExtras,
    ) -> Result<DataId, DataError> {
        let id = if id == DATA_ID_NULL { self.unique() } else { id };

        if props.read_refs < 0 || props.write_refs < 1 {
            return Err(DataError::BadRefcount);
        }

        let value = match (dtype, extras) {
            (DataType::Container, CreateExtras::Container { key, val }) => {
                Value::Container {
                    key_type: key,
                    val_type: val,
                    entries: BTreeMap::new(),
                }
            }
            (DataType::Multiset, CreateExtras::Multiset { elem }) => {
                Value::Multiset {
                    elem_type: elem,
                    elems: Vec::new(),
                }
            }
            (DataType::Struct, CreateExtras::Struct { struct_type }) => {
                if struct_type as usize >= self.struct_types.len() {
                    return Err(DataError::Invalid);
                }
                Value::Struct {
                    struct_type,
                    fields: BTreeMap::new(),
                }
            }
            (t, CreateExtras::None) if t.is_scalar() => Value::Scalar(None),
            _ => return Err(DataError::Invalid),
        };

        let MapEntry::Vacant(vacant) = self.map.entry(id) else {
            return Err(DataError::Exists);
        };
        vacant.insert(Datum {
            dtype,
            value,
            read_refs: props.read_refs as i64,
            write_refs: props.write_refs as i64,
            props,
            flags: DatumFlags::empty(),
            lock: None,
            subscribers: Vec::new(),
        });
        log::debug!("data create <{id}> {dtype:?} {:?}", props.placement);
        Ok(id)
    }

    pub fn exists(
        &mut self,
        id: DataId,
        sub: Option<&[u8]>,
        decr: Refcounts,
    ) -> Result<(bool, Notifications), DataError> {
        let mut notifs = Notifications::default();
        let (known, present) = match self.map.get(&id) {
            None => (false, false),
            Some(datum) => match sub {
                None => (true, true),
                Some(sub) => {
                    let set = self.member_type(datum, sub).is_ok()
                        && datum
                            .slot(sub)
                            .map(|s| s.value.is_some())
                            .unwrap_or(false);
                    (true, set)
                }
            },
        };
        if known && !decr.is_none() {
            self.apply_refcount(id, negate(decr), &mut notifs)?;
        }
        Ok((present, notifs))
    }

    pub fn typeof_(&self, id: DataId) -> Result<DataType, DataError> {
        Ok(self.map.get(&id).ok_or(DataError::NotFound)?.dtype)
    }

    /// A container's `(key type, value type)` pair. Multisets are
    /// unkeyed, so both halves report the element type.
    pub fn container_typeof(
        &self,
        id: DataId,
    ) -> Result<(DataType, DataType), DataError> {
        match &self.map.get(&id).ok_or(DataError::NotFound)?.value {
            Value::Container { key_type, val_type, .. } => {
                Ok((*key_type, *val_type))
            }
            Value::Multiset { elem_type, .. } => Ok((*elem_type, *elem_type)),
            _ => Err(DataError::WrongType),
        }
    }

    /// Stores a value into a datum or one of its slots. Set-once: a
    /// second store to the same place returns `DoubleWrite`.
    pub fn store(
        &mut self,
        id: DataId,
        sub: Option<&[u8]>,
        dtype: DataType,
        bytes: &[u8],
        decr: Refcounts,
        store_refs: Refcounts,
    ) -> Result<Notifications, DataError> {
        let mut notifs = Notifications::default();

        // Validate against an immutable view first; mutation below is
        // then infallible until the refcount step.
        {
            let datum = self.map.get(&id).ok_or(DataError::NotFound)?;
            if datum.is_closed() {
                return Err(DataError::DoubleWrite);
            }
            match (&datum.value, sub) {
                (Value::Scalar(v), None) => {
                    if datum.dtype != dtype {
                        return Err(DataError::WrongType);
                    }
                    if v.is_some() {
                        return Err(DataError::DoubleWrite);
                    }
                }
                (Value::Multiset { elem_type, .. }, None) => {
                    if *elem_type != dtype {
                        return Err(DataError::WrongType);
                    }
                }
                (Value::Container { .. } | Value::Struct { .. }, Some(s)) => {
                    if self.member_type(datum, s)? != dtype {
                        return Err(DataError::WrongType);
                    }
                    if datum
                        .slot(s)
                        .map(|slot| slot.value.is_some())
                        .unwrap_or(false)
                    {
                        return Err(DataError::DoubleWrite);
                    }
                }
                _ => return Err(DataError::Invalid),
            }
        }

        let datum = self.map.get_mut(&id).unwrap();
        match sub {
            None => match &mut datum.value {
                Value::Scalar(v) => {
                    *v = Some(bytes.to_vec());
                    log::debug!("data store <{id}> = {} bytes", bytes.len());
                }
                Value::Multiset { elems, .. } => elems.push(bytes.to_vec()),
                _ => unreachable!("validated above"),
            },
            Some(s) => {
                let slot = datum.slot_ensure(s);
                slot.value = Some(bytes.to_vec());
                let pending = std::mem::take(&mut slot.pending_refs);
                log::debug!(
                    "data store <{id}>[{}] = {} bytes",
                    String::from_utf8_lossy(s),
                    bytes.len(),
                );

                // The slot's value is now known: resolve references
                // waiting on it and fire subscript-scoped subscribers.
                for p in pending {
                    notifs.refs.push(RefStore {
                        id: p.ref_id,
                        sub: p.ref_sub,
                        dtype: p.ref_type,
                        value: bytes.to_vec(),
                        store_refs: p.transfer,
                    });
                }
                let subscribers = std::mem::take(&mut datum.subscribers);
                let mut kept = Vec::with_capacity(subscribers.len());
                for subscriber in subscribers {
                    if subscriber.sub.as_deref() == Some(s) {
                        notifs.closes.push(CloseNotif {
                            rank: subscriber.rank,
                            work_type: subscriber.work_type,
                            id,
                            sub: Some(s.to_vec()),
                        });
                    } else {
                        kept.push(subscriber);
                    }
                }
                datum.subscribers = kept;
            }
        }

        // Refcounts transferred to references embedded in the value.
        if dtype == DataType::Ref && !store_refs.is_none() {
            let referand =
                abi::id_from_bytes(bytes).ok_or(DataError::Invalid)?;
            notifs.rc_ops.push(RcOp { id: referand, change: store_refs });
        }

        if !decr.is_none() {
            self.apply_refcount(id, negate(decr), &mut notifs)?;
        }
        Ok(notifs)
    }

    /// Copies a value out, applying `decr` to this datum and `acquire`
    /// to a retrieved reference, atomically with the read.
    pub fn retrieve(
        &mut self,
        id: DataId,
        sub: Option<&[u8]>,
        decr: Refcounts,
        acquire: Refcounts,
    ) -> Result<(DataType, Vec<u8>, Notifications), DataError> {
        let mut notifs = Notifications::default();
        let datum = self.map.get(&id).ok_or(DataError::NotFound)?;

        let (dtype, bytes) = match (&datum.value, sub) {
            (Value::Scalar(v), None) => {
                let v = v.as_ref().ok_or(DataError::NotSet)?;
                (datum.dtype, v.clone())
            }
            (Value::Multiset { elem_type, elems }, None) => {
                // A whole-multiset retrieve returns the packed element
                // list.
                let mut out = Vec::new();
                for e in elems {
                    abi::pack_bytes(&mut out, e);
                }
                (*elem_type, out)
            }
            (Value::Container { .. } | Value::Struct { .. }, Some(s)) => {
                let member = self.member_type(datum, s)?;
                let slot = datum.slot(s).ok_or(DataError::NotSet)?;
                let v = slot.value.as_ref().ok_or(DataError::NotSet)?;
                (member, v.clone())
            }
            _ => return Err(DataError::Invalid),
        };

        if dtype == DataType::Ref && !acquire.is_none() {
            let referand =
                abi::id_from_bytes(&bytes).ok_or(DataError::Invalid)?;
            notifs.rc_ops.push(RcOp { id: referand, change: acquire });
        }
        if !decr.is_none() {
            self.apply_refcount(id, negate(decr), &mut notifs)?;
        }
        log::debug!("data retrieve <{id}>");
        Ok((dtype, bytes, notifs))
    }

    /// Registers `rank` for a close notification. Returns `false` (and
    /// registers nothing) if the datum / subscript is already closed.
    pub fn subscribe(
        &mut self,
        id: DataId,
        sub: Option<&[u8]>,
        rank: Rank,
        work_type: WorkType,
    ) -> Result<bool, DataError> {
        let datum = self.map.get_mut(&id).ok_or(DataError::NotFound)?;
        match sub {
            None => {
                if datum.is_closed() {
                    return Ok(false);
                }
            }
            Some(s) => {
                let set = datum
                    .slot(s)
                    .map(|slot| slot.value.is_some())
                    .unwrap_or(false);
                if set || datum.is_closed() {
                    // Either the value is there, or the datum closed and
                    // the subscript can never be assigned: no
                    // notification will ever be owed.
                    return Ok(false);
                }
            }
        }
        // At most one registration per (rank, subscript).
        let dup = datum
            .subscribers
            .iter()
            .any(|x| x.rank == rank && x.sub.as_deref() == sub);
        if !dup {
            datum.subscribers.push(Subscriber {
                rank,
                work_type,
                sub: sub.map(|s| s.to_vec()),
            });
        }
        log::debug!("data subscribe <{id}> by rank {rank}");
        Ok(true)
    }

    /// The universal refcount operation; all closes and frees funnel
    /// through here. Raising the write count is forbidden.
    pub fn refcount_incr(
        &mut self,
        id: DataId,
        change: Refcounts,
    ) -> Result<Notifications, DataError> {
        let mut notifs = Notifications::default();
        self.apply_refcount(id, change, &mut notifs)?;
        Ok(notifs)
    }

    /// When `id[sub]` is set, immediately schedules a store of its value
    /// into `(ref_id, ref_sub)`; otherwise records the reference on the
    /// slot to resolve when the value arrives.
    #[allow(clippy::too_many_arguments)]
    pub fn container_reference(
        &mut self,
        id: DataId,
        sub: &[u8],
        ref_id: DataId,
        ref_sub: Option<&[u8]>,
        ref_type: DataType,
        transfer: Refcounts,
        decr: Refcounts,
    ) -> Result<Notifications, DataError> {
        let mut notifs = Notifications::default();
        {
            let datum = self.map.get(&id).ok_or(DataError::NotFound)?;
            self.member_type(datum, sub)?;
        }

        let datum = self.map.get_mut(&id).unwrap();
        let slot = datum.slot_ensure(sub);
        match &slot.value {
            Some(v) => notifs.refs.push(RefStore {
                id: ref_id,
                sub: ref_sub.map(|s| s.to_vec()),
                dtype: ref_type,
                value: v.clone(),
                store_refs: transfer,
            }),
            None => slot.pending_refs.push(PendingRef {
                ref_id,
                ref_sub: ref_sub.map(|s| s.to_vec()),
                ref_type,
                transfer,
            }),
        }

        if !decr.is_none() {
            self.apply_refcount(id, negate(decr), &mut notifs)?;
        }
        Ok(notifs)
    }

    /// Create-if-absent on one slot. Returns `(created,
    /// existing_value)`: `created` means a placeholder was made;
    /// otherwise the slot existed and `existing_value` is its value if
    /// already set.
    pub fn insert_atomic(
        &mut self,
        id: DataId,
        sub: &[u8],
        acquire: Refcounts,
        want_value: bool,
    ) -> Result<(bool, Option<(DataType, Vec<u8>)>, Notifications), DataError>
    {
        let mut notifs = Notifications::default();
        let member = {
            let datum = self.map.get(&id).ok_or(DataError::NotFound)?;
            self.member_type(datum, sub)?
        };

        let created = {
            let datum = self.map.get_mut(&id).unwrap();
            if datum.slot(sub).is_none() {
                if datum.is_closed() {
                    return Err(DataError::DoubleWrite);
                }
                datum.slot_ensure(sub);
                true
            } else {
                false
            }
        };
        if created {
            return Ok((true, None, notifs));
        }

        let datum = self.map.get(&id).unwrap();
        let slot = datum.slot(sub).unwrap();
        let value = match &slot.value {
            None => None,
            Some(v) => {
                let v = v.clone();
                if member == DataType::Ref && !acquire.is_none() {
                    let referand =
                        abi::id_from_bytes(&v).ok_or(DataError::Invalid)?;
                    notifs.rc_ops.push(RcOp { id: referand, change: acquire });
                }
                want_value.then_some((member, v))
            }
        };
        Ok((false, value, notifs))
    }

    /// Lists the set entries of a container in key order, returning the
    /// window `[offset, offset + count)` (`count < 0` = to the end).
    pub fn enumerate(
        &mut self,
        id: DataId,
        count: i32,
        offset: i32,
        want_subscripts: bool,
        want_members: bool,
        decr: Refcounts,
    ) -> Result<(u32, Vec<u8>, Vec<u8>, Notifications), DataError> {
        let mut notifs = Notifications::default();
        let mut subscripts = Vec::new();
        let mut members = Vec::new();
        let mut actual = 0u32;
        {
            let datum = self.map.get(&id).ok_or(DataError::NotFound)?;
            let (val_type, entries) = match &datum.value {
                Value::Container { val_type, entries, .. } => {
                    (*val_type, entries)
                }
                _ => return Err(DataError::WrongType),
            };

            let offset = offset.max(0) as usize;
            let take = if count < 0 { usize::MAX } else { count as usize };
            for (key, value) in entries
                .iter()
                .filter_map(|(k, s)| s.value.as_ref().map(|v| (k, v)))
                .skip(offset)
                .take(take)
            {
                actual += 1;
                if want_subscripts {
                    abi::pack_bytes(&mut subscripts, key);
                }
                if want_members {
                    members.push(val_type.as_u8());
                    abi::pack_bytes(&mut members, value);
                }
            }
        }

        if !decr.is_none() {
            self.apply_refcount(id, negate(decr), &mut notifs)?;
        }
        Ok((actual, subscripts, members, notifs))
    }

    /// Number of set entries (container) or elements (multiset).
    pub fn container_size(
        &mut self,
        id: DataId,
        decr: Refcounts,
    ) -> Result<(i64, Notifications), DataError> {
        let mut notifs = Notifications::default();
        let size = {
            let datum = self.map.get(&id).ok_or(DataError::NotFound)?;
            match &datum.value {
                Value::Container { entries, .. } => entries
                    .values()
                    .filter(|s| s.value.is_some())
                    .count() as i64,
                Value::Multiset { elems, .. } => elems.len() as i64,
                _ => return Err(DataError::WrongType),
            }
        };
        if !decr.is_none() {
            self.apply_refcount(id, negate(decr), &mut notifs)?;
        }
        Ok((size, notifs))
    }

    /// Advisory single-owner lock. Returns whether the lock was
    /// granted.
    pub fn lock(&mut self, id: DataId, rank: Rank) -> Result<bool, DataError> {
        let datum = self.map.get_mut(&id).ok_or(DataError::NotFound)?;
        match datum.lock {
            None => {
                datum.lock = Some(rank);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    pub fn unlock(&mut self, id: DataId) -> Result<(), DataError> {
        let datum = self.map.get_mut(&id).ok_or(DataError::NotFound)?;
        if datum.lock.take().is_none() {
            return Err(DataError::Invalid);
        }
        Ok(())
    }

    /// Applies a refcount delta; on write-zero, fires close
    /// notifications exactly once; on both-zero, frees the datum unless
    /// permanent.
    fn apply_refcount(
        &mut self,
        id: DataId,
        change: Refcounts,
        notifs: &mut Notifications,
    ) -> Result<(), DataError> {
        let datum = self.map.get_mut(&id).ok_or(DataError::NotFound)?;

        if change.write > 0 {
            // Write counts only ever go down after creation.
            return Err(DataError::BadRefcount);
        }
        let read = datum.read_refs + change.read as i64;
        let write = datum.write_refs + change.write as i64;
        if read < 0 || write < 0 {
            return Err(DataError::BadRefcount);
        }
        datum.read_refs = read;
        datum.write_refs = write;
        log::trace!("data refcount <{id}> read={read} write={write}");

        if write == 0 && !datum.is_closed() {
            datum.flags |= DatumFlags::CLOSED;
            log::debug!("data closed <{id}>");
            let subscribers = std::mem::take(&mut datum.subscribers);
            let mut kept = Vec::new();
            for s in subscribers {
                match s.sub {
                    None => notifs.closes.push(CloseNotif {
                        rank: s.rank,
                        work_type: s.work_type,
                        id,
                        sub: None,
                    }),
                    // Subscript waiters fire on assignment, which can no
                    // longer happen; they stay for the finalize report.
                    Some(_) => kept.push(s),
                }
            }
            datum.subscribers = kept;
        }

        if read == 0 && write == 0 && !datum.props.permanent {
            log::debug!("data free <{id}>");
            self.map.remove(&id);
        }
        Ok(())
    }

    /// Resolves a subscript to the member type it addresses.
    fn member_type(
        &self,
        datum: &Datum,
        sub: &[u8],
    ) -> Result<DataType, DataError> {
        match &datum.value {
            Value::Container { val_type, .. } => Ok(*val_type),
            Value::Struct { struct_type, .. } => {
                self.struct_member_type(*struct_type, sub)
            }
            _ => Err(DataError::Invalid),
        }
    }

    /// Walks a `.`-separated field-index path through the struct type
    /// registry.
    fn struct_member_type(
        &self,
        struct_type: u32,
        path: &[u8],
    ) -> Result<DataType, DataError> {
        let path =
            std::str::from_utf8(path).map_err(|_| DataError::Invalid)?;
        let mut current = struct_type;
        let mut segments = path.split('.').peekable();
        loop {
            let seg = segments.next().ok_or(DataError::Invalid)?;
            let ix: usize = seg.parse().map_err(|_| DataError::Invalid)?;
            let st = self
                .struct_types
                .get(current as usize)
                .ok_or(DataError::Invalid)?;
            let field = st.fields.get(ix).ok_or(DataError::Invalid)?;
            if segments.peek().is_none() {
                return Ok(field.dtype);
            }
            if field.dtype != DataType::Struct {
                return Err(DataError::Invalid);
            }
            current = field.struct_type.ok_or(DataError::Invalid)?;
        }
    }

    /// Counts subscriptions that can never fire (subscript waiters on
    /// closed datums) at shutdown.
    pub fn finalize(&self) -> usize {
        let mut stuck = 0;
        for (id, datum) in &self.map {
            if !datum.is_closed() {
                continue;
            }
            for s in &datum.subscribers {
                if let Some(sub) = &s.sub {
                    stuck += 1;
                    log::warn!(
                        "unfillable subscription: <{id}>[{}] rank {}",
                        String::from_utf8_lossy(sub),
                        s.rank,
                    );
                }
            }
        }
        stuck
    }
}

fn negate(rc: Refcounts) -> Refcounts {
    Refcounts { read: -rc.read, write: -rc.write }
}
