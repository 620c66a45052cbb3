use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Per-object flag bits stored in the object table beside the object
/// pointer, so the mark and gather sweeps test them without touching the
/// object itself. All mutation goes through the atomic helpers on
/// `ObjectItem`; the values here are just the bit assignments.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct ObjectFlags(u32);

impl ObjectFlags {
    pub const NONE: ObjectFlags = ObjectFlags(0);
    /// Candidate for destruction. Set during mark, cleared during
    /// reachability when any strong reference reaches the object.
    pub const UNREACHABLE: ObjectFlags = ObjectFlags(1 << 0);
    /// Cluster member reached during this cycle. Cleared for every object
    /// during mark.
    pub const REACHABLE_IN_CLUSTER: ObjectFlags = ObjectFlags(1 << 1);
    /// The object owns a cluster; its owner word encodes the cluster index.
    pub const CLUSTER_ROOT: ObjectFlags = ObjectFlags(1 << 2);
    /// Member of the root set; never marked unreachable.
    pub const ROOT_SET: ObjectFlags = ObjectFlags(1 << 3);
    /// Fast keep flag tested during mark before the slower user keep flags.
    pub const KEEP_ALIVE: ObjectFlags = ObjectFlags(1 << 4);
    /// Explicitly discarded by the mutator. Killable references to the
    /// object are nulled during tracing and the object is not kept alive by
    /// user keep flags.
    pub const GARBAGE: ObjectFlags = ObjectFlags(1 << 5);
    /// Still being constructed by the allocator; excluded from collection.
    pub const PENDING_CONSTRUCTION: ObjectFlags = ObjectFlags(1 << 6);
    /// BeginDestroy has been routed to the object.
    pub const BEGUN_DESTROY: ObjectFlags = ObjectFlags(1 << 7);
    /// FinishDestroy has been routed to the object.
    pub const FINISHED_DESTROY: ObjectFlags = ObjectFlags(1 << 8);

    /// Flags that keep an object alive without consulting the binding.
    pub const GC_KEEP_FLAGS: ObjectFlags = ObjectFlags::KEEP_ALIVE;

    pub const fn from_bits(bits: u32) -> ObjectFlags {
        ObjectFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains_any(self, flags: ObjectFlags) -> bool {
        self.0 & flags.0 != 0
    }

    pub const fn contains_all(self, flags: ObjectFlags) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ObjectFlags {
    type Output = ObjectFlags;
    fn bitor(self, rhs: ObjectFlags) -> ObjectFlags {
        ObjectFlags(self.0 | rhs.0)
    }
}

impl BitAnd for ObjectFlags {
    type Output = ObjectFlags;
    fn bitand(self, rhs: ObjectFlags) -> ObjectFlags {
        ObjectFlags(self.0 & rhs.0)
    }
}

impl Not for ObjectFlags {
    type Output = ObjectFlags;
    fn not(self) -> ObjectFlags {
        ObjectFlags(!self.0)
    }
}

impl fmt::Debug for ObjectFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(u32, &str); 9] = [
            (1 << 0, "UNREACHABLE"),
            (1 << 1, "REACHABLE_IN_CLUSTER"),
            (1 << 2, "CLUSTER_ROOT"),
            (1 << 3, "ROOT_SET"),
            (1 << 4, "KEEP_ALIVE"),
            (1 << 5, "GARBAGE"),
            (1 << 6, "PENDING_CONSTRUCTION"),
            (1 << 7, "BEGUN_DESTROY"),
            (1 << 8, "FINISHED_DESTROY"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// User-level keep flags, opaque to the collector. The mark phase hands them
/// to the binding which matches them against the object's own flag word.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct KeepFlags(pub u32);

impl KeepFlags {
    pub const NONE: KeepFlags = KeepFlags(0);

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_set_operations() {
        let flags = ObjectFlags::UNREACHABLE | ObjectFlags::CLUSTER_ROOT;
        assert!(flags.contains_any(ObjectFlags::UNREACHABLE));
        assert!(flags.contains_all(ObjectFlags::UNREACHABLE | ObjectFlags::CLUSTER_ROOT));
        assert!(!flags.contains_all(ObjectFlags::UNREACHABLE | ObjectFlags::ROOT_SET));
        assert!((flags & !ObjectFlags::UNREACHABLE) == ObjectFlags::CLUSTER_ROOT);
    }

    #[test]
    fn debug_formatting_names_bits() {
        let flags = ObjectFlags::UNREACHABLE | ObjectFlags::GARBAGE;
        assert_eq!(format!("{:?}", flags), "UNREACHABLE|GARBAGE");
        assert_eq!(format!("{:?}", ObjectFlags::NONE), "NONE");
    }
}
