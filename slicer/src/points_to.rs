//! The interface to the points-to oracle: an (externally computed) answer to "which abstract memory
//! objects may this pointer refer to".
//!
//! The slicer only ever consumes points-to information through [`PointsToOracle`]. A
//! [`PointsToTable`] is provided for hosts that have the results of some points-to analysis at
//! hand and just need to plug them in.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::il::{InstKind, Program, Value};

/// An oracle-assigned abstract memory location.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryLocation(pub u32);

impl std::fmt::Debug for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "loc#{}", self.0)
    }
}

/// The set of locations a pointer may refer to.
pub type PointsToSet = UnorderedSet<MemoryLocation>;

/// Byte offset of a location into its memory object. Array accesses and accesses at non-constant
/// offsets collapse to [`Offset::Unknown`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Offset {
    Known(u64),
    Unknown,
}

/// The identity of an abstract memory object: the value that defined it, and an offset into it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationSite {
    pub value: Value,
    pub offset: Offset,
}

impl std::fmt::Debug for AllocationSite {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.offset {
            Offset::Known(o) => write!(f, "{:?}+{}", self.value, o),
            Offset::Unknown => write!(f, "{:?}+?", self.value),
        }
    }
}

/// Where a memory object lives.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum ObjectKind {
    /// Local to a single activation of the function defining it
    Stack,
    Global,
    Heap,
    Function,
}

/// An abstract memory object.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MemoryObject {
    pub kind: ObjectKind,
    pub site: AllocationSite,
}

/// What the oracle knows about a location.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PointsToNode {
    /// An actual memory object
    Object(MemoryObject),
    /// A pointer-valued node. These should never show up as the target of a pointer.
    Pointer,
}

/// An oracle answering points-to queries. Answers must be deterministic for a fixed program.
pub trait PointsToOracle {
    /// The locations that `pointer` may refer to
    fn resolve(&self, pointer: &Value) -> PointsToSet;

    /// The node behind `loc`
    fn node(&self, loc: MemoryLocation) -> PointsToNode;

    /// The memory object behind `loc`.
    ///
    /// Panics if `loc` is not an object: the oracle and its client then disagree about what is a
    /// memory object, and nothing sensible can be computed from there.
    fn object_of(&self, loc: MemoryLocation) -> MemoryObject {
        match self.node(loc) {
            PointsToNode::Object(obj) => obj,
            PointsToNode::Pointer => panic!(
                "Location {:?} was expected to be a memory object, but is a pointer node",
                loc
            ),
        }
    }

    /// The allocation site of `loc`. Panics if `loc` is not an object.
    fn allocation_site_of(&self, loc: MemoryLocation) -> AllocationSite {
        self.object_of(loc).site
    }
}

/// A points-to oracle backed by explicit tables.
#[derive(Default, Debug)]
pub struct PointsToTable {
    nodes: Vec<PointsToNode>,
    points_to: UnorderedMap<Value, PointsToSet>,
}

impl PointsToTable {
    /// An empty table; every pointer resolves to nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with one object per global and per stack allocation in `program`, where the global
    /// (resp. the result of the allocation) points to its own object at offset 0.
    pub fn with_direct_objects(program: &Program) -> Self {
        let mut r = Self::new();
        for i in 0..program.globals.len() {
            let g = Value::Global(crate::il::GlobalId(i));
            r.add_direct_object(ObjectKind::Global, g);
        }
        for func in program.functions() {
            for ins in func.instructions() {
                if let InstKind::Alloca { .. } = ins.kind {
                    r.add_direct_object(ObjectKind::Stack, Value::Inst(ins.id));
                }
            }
        }
        r
    }

    fn add_direct_object(&mut self, kind: ObjectKind, value: Value) -> MemoryLocation {
        let loc = self.add_object(
            kind,
            AllocationSite {
                value: value.clone(),
                offset: Offset::Known(0),
            },
        );
        self.add_points_to(value, loc);
        loc
    }

    /// Add a new memory object
    pub fn add_object(&mut self, kind: ObjectKind, site: AllocationSite) -> MemoryLocation {
        self.nodes
            .push(PointsToNode::Object(MemoryObject { kind, site }));
        MemoryLocation((self.nodes.len() - 1) as u32)
    }

    /// Add a new pointer node
    pub fn add_pointer_node(&mut self) -> MemoryLocation {
        self.nodes.push(PointsToNode::Pointer);
        MemoryLocation((self.nodes.len() - 1) as u32)
    }

    /// Record that `pointer` may refer to `loc`
    pub fn add_points_to(&mut self, pointer: Value, loc: MemoryLocation) {
        assert!((loc.0 as usize) < self.nodes.len(), "Unknown location {:?}", loc);
        self.points_to.entry(pointer).or_default().insert(loc);
    }

    /// The location of the object allocated at `site`, if any
    pub fn location_of(&self, site: &AllocationSite) -> Option<MemoryLocation> {
        self.nodes
            .iter()
            .position(|n| matches!(n, PointsToNode::Object(o) if o.site == *site))
            .map(|i| MemoryLocation(i as u32))
    }
}

impl PointsToOracle for PointsToTable {
    fn resolve(&self, pointer: &Value) -> PointsToSet {
        self.points_to.get(pointer).cloned().unwrap_or_default()
    }

    fn node(&self, loc: MemoryLocation) -> PointsToNode {
        self.nodes
            .get(loc.0 as usize)
            .cloned()
            .unwrap_or_else(|| panic!("Location {:?} unknown to the oracle", loc))
    }
}
