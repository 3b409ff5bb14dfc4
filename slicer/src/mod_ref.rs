//! Modification/reference analysis: which memory writes of each target function are side effects
//! observable by the rest of the program.
//!
//! For each target, every store in its reachable closure contributes the locations it may write
//! (its "mod" points-to set). Every load reachable from the program's entry contributes the
//! locations it may read (the global "ref" points-to set). Stores writing a location in both are
//! kept, and every allocation site a kept store may write becomes a side effect of the target,
//! identified by a slice id. A target with a return value additionally gets a side effect for that
//! value.

use std::rc::Rc;

use itertools::Itertools;

use crate::config::{DumpConfig, SlicerConfig};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::InsertionOrderedSet;
use crate::error::SlicerError;
use crate::il::{FunctionId, InstId, InstKind, Instruction, Opcode, Program, Value};
use crate::log::*;
use crate::points_to::{AllocationSite, MemoryLocation, ObjectKind, PointsToOracle, PointsToSet};
use crate::reachability::ReachabilityAnalysis;

/// Identifier of a slice. Handed out contiguously starting at 1.
pub type SliceId = u32;

/// A memory modification performed (transitively) by a target function, identified by the
/// allocation site it writes into.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ModInfo {
    pub function: FunctionId,
    pub site: AllocationSite,
}

/// The kind of a [`SideEffect`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SideEffectKind {
    ReturnValue,
    Modifier,
}

/// An independent side effect of a target function, along with its unique slice id.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SideEffect {
    /// The value returned by `function`
    ReturnValue {
        function: FunctionId,
        slice_id: SliceId,
    },
    /// A write into an object observed elsewhere in the program
    Modifier {
        mod_info: ModInfo,
        slice_id: SliceId,
    },
}

impl SideEffect {
    /// The target function producing this side effect
    pub fn function(&self) -> FunctionId {
        match self {
            SideEffect::ReturnValue { function, .. } => *function,
            SideEffect::Modifier { mod_info, .. } => mod_info.function,
        }
    }

    pub fn slice_id(&self) -> SliceId {
        match self {
            SideEffect::ReturnValue { slice_id, .. } | SideEffect::Modifier { slice_id, .. } => {
                *slice_id
            }
        }
    }

    pub fn kind(&self) -> SideEffectKind {
        match self {
            SideEffect::ReturnValue { .. } => SideEffectKind::ReturnValue,
            SideEffect::Modifier { .. } => SideEffectKind::Modifier,
        }
    }
}

/// Results of the mod-ref analysis
pub struct ModRefAnalysis {
    program: Rc<Program>,
    reachability: Rc<ReachabilityAnalysis>,
    entry: FunctionId,
    /// Targets, in the order they were configured
    targets: Vec<FunctionId>,

    /// Locations (transitively) written by each target
    mod_pts: UnorderedMap<FunctionId, PointsToSet>,
    /// Stores of each target, by the location they write
    obj_to_store: UnorderedMap<(FunctionId, MemoryLocation), UnorderedSet<InstId>>,
    /// Locations read anywhere in the program
    ref_pts: PointsToSet,
    /// Loads of each location, anywhere in the program
    obj_to_load: UnorderedMap<MemoryLocation, UnorderedSet<InstId>>,
    /// Stores to each location, anywhere in the program
    obj_to_overriding_store: UnorderedMap<MemoryLocation, UnorderedSet<InstId>>,

    /// Stores whose effect is observable, per target
    mod_sets: UnorderedMap<FunctionId, UnorderedSet<InstId>>,
    load_to_store: UnorderedMap<InstId, UnorderedSet<InstId>>,
    load_to_mod_info: UnorderedMap<InstId, UnorderedSet<ModInfo>>,
    overriding_stores: UnorderedSet<InstId>,

    mod_info_to_store: UnorderedMap<ModInfo, UnorderedSet<InstId>>,
    mod_info_to_id: UnorderedMap<ModInfo, SliceId>,
    ret_slice_id: UnorderedMap<FunctionId, SliceId>,
    side_effects: Vec<SideEffect>,
}

impl ModRefAnalysis {
    /// Run the analysis over the (already trimmed) `program`, for the entry and targets named in
    /// `config`.
    pub fn run(
        program: &Rc<Program>,
        reachability: &Rc<ReachabilityAnalysis>,
        oracle: &dyn PointsToOracle,
        config: &SlicerConfig,
    ) -> Result<Self, SlicerError> {
        let entry = program.function_by_name(&config.entry).ok_or_else(|| {
            crit!("Entry function not found"; "entry" => &config.entry);
            SlicerError::EntryNotFound(config.entry.clone())
        })?;
        let mut targets = InsertionOrderedSet::new();
        for name in &config.targets {
            let f = program.function_by_name(name).ok_or_else(|| {
                crit!("Target function not found"; "target" => name);
                SlicerError::TargetNotFound(name.clone())
            })?;
            if targets.contains(&f) {
                crit!("Target function listed twice"; "target" => name);
                return Err(SlicerError::DuplicateTarget(name.clone()));
            }
            targets.insert(f);
        }

        let mut r = Self {
            program: program.clone(),
            reachability: reachability.clone(),
            entry,
            targets: targets.into_vec(),
            mod_pts: Default::default(),
            obj_to_store: Default::default(),
            ref_pts: Default::default(),
            obj_to_load: Default::default(),
            obj_to_overriding_store: Default::default(),
            mod_sets: Default::default(),
            load_to_store: Default::default(),
            load_to_mod_info: Default::default(),
            overriding_stores: Default::default(),
            mod_info_to_store: Default::default(),
            mod_info_to_id: Default::default(),
            ret_slice_id: Default::default(),
            side_effects: vec![],
        };

        for t in r.targets.clone() {
            r.collect_mod_info(t, oracle);
        }
        r.collect_ref_info(oracle);
        r.compute_mod_ref_info(oracle);
        r.compute_mod_info_to_store_map(oracle);

        r.dump_mod_set_map();
        r.dump(&config.dumps());

        Ok(r)
    }

    /// Record every store in the reachable closure of `target`, along with what it may write
    fn collect_mod_info(&mut self, target: FunctionId, oracle: &dyn PointsToOracle) {
        let program = self.program.clone();
        let reachable = self.reachability.reachable_from(&program, target);
        // Whether the declaring function of a stack object can reach `target`
        let mut escape_cache: UnorderedMap<FunctionId, bool> = Default::default();

        self.mod_pts.entry(target).or_default();
        for &f in reachable.iter() {
            let func = match program.function(f) {
                Some(func) if !func.is_declaration() => func,
                _ => continue,
            };
            for ins in func.instructions() {
                if ins.opcode() == Opcode::Store {
                    self.add_store(target, ins, oracle, &mut escape_cache);
                }
            }
        }
    }

    fn add_store(
        &mut self,
        target: FunctionId,
        store: &Instruction,
        oracle: &dyn PointsToOracle,
        escape_cache: &mut UnorderedMap<FunctionId, bool>,
    ) {
        let pts = oracle.resolve(pointer_operand(store));
        for &loc in pts.iter() {
            let obj = oracle.object_of(loc);
            if obj.kind == ObjectKind::Stack
                && self.can_ignore_stack_object(target, &obj.site.value, escape_cache)
            {
                trace!("Ignoring store to stack object";
                       "store" => ?store.id, "site" => ?obj.site);
                continue;
            }
            self.obj_to_store
                .entry((target, loc))
                .or_default()
                .insert(store.id);
            self.mod_pts.entry(target).or_default().insert(loc);
        }
    }

    /// A stack object can be ignored for `target` unless the function declaring it can reach
    /// `target` again; otherwise the object cannot outlive the declaring call.
    fn can_ignore_stack_object(
        &self,
        target: FunctionId,
        value: &Value,
        escape_cache: &mut UnorderedMap<FunctionId, bool>,
    ) -> bool {
        let declaring = match value {
            Value::Inst(i) => match self.program.instruction(*i) {
                Some(Instruction {
                    kind: InstKind::Alloca { .. },
                    ..
                }) => i.function,
                _ => return false,
            },
            _ => return false,
        };
        let program = &self.program;
        let reachability = &self.reachability;
        let reaches_target = *escape_cache.entry(declaring).or_insert_with(|| {
            reachability
                .reachable_from(program, declaring)
                .contains(&target)
        });
        !reaches_target
    }

    /// Record every load (and store) reachable from the entry point
    fn collect_ref_info(&mut self, oracle: &dyn PointsToOracle) {
        let program = self.program.clone();
        let reachable = self.reachability.reachable_from(&program, self.entry);
        for &f in reachable.iter() {
            let func = match program.function(f) {
                Some(func) if !func.is_declaration() => func,
                _ => continue,
            };
            for ins in func.instructions() {
                match ins.opcode() {
                    Opcode::Load => {
                        let pts = oracle.resolve(pointer_operand(ins));
                        for &loc in pts.iter() {
                            self.obj_to_load.entry(loc).or_default().insert(ins.id);
                        }
                        self.ref_pts.extend(pts);
                    }
                    Opcode::Store => {
                        for loc in oracle.resolve(pointer_operand(ins)) {
                            self.obj_to_overriding_store
                                .entry(loc)
                                .or_default()
                                .insert(ins.id);
                        }
                    }
                    Opcode::Call | Opcode::Return | Opcode::Other => {}
                }
            }
        }
    }

    /// Intersect each target's mod set with the ref set, and relate the surviving stores to the
    /// loads that may observe them
    fn compute_mod_ref_info(&mut self, oracle: &dyn PointsToOracle) {
        let empty = UnorderedSet::new();
        for (&f, mod_pts) in self.mod_pts.iter() {
            let observed = mod_pts & &self.ref_pts;
            let mod_set = self.mod_sets.entry(f).or_default();

            for &loc in observed.iter() {
                let stores = self.obj_to_store.get(&(f, loc)).unwrap_or(&empty);
                mod_set.extend(stores);

                let mod_info = ModInfo {
                    function: f,
                    site: oracle.allocation_site_of(loc),
                };
                for &load in self.obj_to_load.get(&loc).unwrap_or(&empty) {
                    self.load_to_store.entry(load).or_default().extend(stores);
                    self.load_to_mod_info
                        .entry(load)
                        .or_default()
                        .insert(mod_info.clone());
                }

                self.overriding_stores
                    .extend(self.obj_to_overriding_store.get(&loc).unwrap_or(&empty));
            }
        }
    }

    /// Hand out slice ids: per target (in configured order), first its return value (if any), then
    /// each newly seen allocation site written by a store of its mod set. Every location such a
    /// store may write counts, not only the observed ones.
    fn compute_mod_info_to_store_map(&mut self, oracle: &dyn PointsToOracle) {
        let mut slice_id: SliceId = 1;
        let empty_stores = UnorderedSet::new();

        for &f in &self.targets {
            let func = self
                .program
                .function(f)
                .expect("Targets are resolved from the program");
            if !func.returns_void() {
                self.ret_slice_id.insert(f, slice_id);
                self.side_effects.push(SideEffect::ReturnValue {
                    function: f,
                    slice_id,
                });
                slice_id += 1;
            }

            let mod_set = self.mod_sets.get(&f).unwrap_or(&empty_stores);
            for &store in mod_set.iter().sorted() {
                let ins = self
                    .program
                    .instruction(store)
                    .expect("Mod set holds only instructions of the program");
                for loc in oracle.resolve(pointer_operand(ins)).into_iter().sorted() {
                    let mod_info = ModInfo {
                        function: f,
                        site: oracle.allocation_site_of(loc),
                    };
                    self.mod_info_to_store
                        .entry(mod_info.clone())
                        .or_default()
                        .insert(store);
                    if !self.mod_info_to_id.contains_key(&mod_info) {
                        self.mod_info_to_id.insert(mod_info.clone(), slice_id);
                        self.side_effects
                            .push(SideEffect::Modifier { mod_info, slice_id });
                        slice_id += 1;
                    }
                }
            }
        }

        debug!("Assigned slice ids"; "count" => self.side_effects.len());
    }
}

impl ModRefAnalysis {
    /// The program analyzed
    pub fn program(&self) -> &Rc<Program> {
        &self.program
    }

    /// The reachability results the analysis was run with
    pub fn reachability(&self) -> &Rc<ReachabilityAnalysis> {
        &self.reachability
    }

    pub fn entry(&self) -> FunctionId {
        self.entry
    }

    /// Target functions, in configured order
    pub fn targets(&self) -> &[FunctionId] {
        &self.targets
    }

    /// All side effects, ordered by slice id
    pub fn side_effects(&self) -> &[SideEffect] {
        &self.side_effects
    }

    /// The side effect with the given slice id
    pub fn side_effect(&self, slice_id: SliceId) -> Option<&SideEffect> {
        self.side_effects.iter().find(|s| s.slice_id() == slice_id)
    }

    /// The slice id of the return value of `f`, if `f` is a target returning a value
    pub fn ret_slice_id(&self, f: FunctionId) -> Option<SliceId> {
        self.ret_slice_id.get(&f).cloned()
    }

    /// Stores of target `f` whose effect is observable elsewhere
    pub fn mod_set(&self, f: FunctionId) -> Option<&UnorderedSet<InstId>> {
        self.mod_sets.get(&f)
    }

    /// Locations (transitively) written by target `f`, after excluding non-escaping stack objects
    pub fn mod_pts(&self, f: FunctionId) -> Option<&PointsToSet> {
        self.mod_pts.get(&f)
    }

    /// Locations read anywhere in the program
    pub fn ref_pts(&self) -> &PointsToSet {
        &self.ref_pts
    }

    pub fn mod_info_to_store_map(&self) -> &UnorderedMap<ModInfo, UnorderedSet<InstId>> {
        &self.mod_info_to_store
    }

    pub fn mod_info_to_id_map(&self) -> &UnorderedMap<ModInfo, SliceId> {
        &self.mod_info_to_id
    }

    /// Stores (anywhere in the program) to some location written by a target and read elsewhere
    pub fn overriding_stores(&self) -> &UnorderedSet<InstId> {
        &self.overriding_stores
    }

    /// Whether `load` may read a value produced by a side effect of some target
    pub fn may_block(&self, load: InstId) -> bool {
        self.load_to_store.contains_key(&load)
    }

    /// Whether `store` may replace a value produced by a side effect of some target, before that
    /// value is observed
    pub fn may_override(&self, store: InstId) -> bool {
        self.overriding_stores.contains(&store)
    }

    /// Stores of targets that `load` may observe
    pub fn blocking_stores(&self, load: InstId) -> Option<&UnorderedSet<InstId>> {
        self.load_to_store.get(&load)
    }

    /// The modifications that may have produced the value read by `load`, restricted to those
    /// whose allocation site is defined by the same value as `hint`.
    ///
    /// Panics if `load` is not a load of the program, or has no recorded modifications.
    pub fn approximate_mod_infos(
        &self,
        load: InstId,
        hint: &AllocationSite,
    ) -> UnorderedSet<ModInfo> {
        assert!(
            matches!(self.program.instruction(load), Some(i) if i.opcode() == Opcode::Load),
            "Expected a load, got {:?}",
            self.program.instruction(load)
        );
        let modifiers = self.load_to_mod_info.get(&load).unwrap_or_else(|| {
            panic!(
                "Load {:?} was expected to have recorded modifications, but has none",
                load
            )
        });
        // Only the allocation sites' defining values are compared; offsets are ignored.
        modifiers
            .iter()
            .filter(|m| m.site.value == hint.value)
            .cloned()
            .collect()
    }
}

/// The address operand of a load or store
fn pointer_operand(ins: &Instruction) -> &Value {
    ins.kind
        .pointer_operand()
        .unwrap_or_else(|| unreachable!("Not a memory access: {:?}", ins))
}

impl ModRefAnalysis {
    fn fn_name(&self, f: FunctionId) -> &str {
        self.program
            .function(f)
            .map(|f| f.name.as_str())
            .unwrap_or("<removed>")
    }

    fn inst_str(&self, i: InstId) -> String {
        match self.program.instruction(i) {
            Some(ins) => format!("[{}] {:?}", self.fn_name(i.function), ins),
            None => format!("{:?}", i),
        }
    }

    fn mod_info_str(&self, m: &ModInfo) -> String {
        format!("{}: {:?}", self.fn_name(m.function), m.site)
    }

    fn insts_str<'a>(&self, is: impl IntoIterator<Item = &'a InstId>) -> String {
        is.into_iter().sorted().map(|&i| self.inst_str(i)).join("; ")
    }

    fn dump_mod_set_map(&self) {
        for (&f, mod_set) in self.mod_sets.iter() {
            info!("Mod set";
                  "function" => self.fn_name(f),
                  OptionalKV("ret_slice_id", self.ret_slice_id(f)),
                  "stores" => self.insts_str(mod_set));
        }
    }

    fn dump(&self, dumps: &DumpConfig) {
        if dumps.load_to_store_map {
            for (&load, stores) in self.load_to_store.iter() {
                info!("Load to stores"; "load" => self.inst_str(load), "stores" => self.insts_str(stores));
            }
        }
        if dumps.load_to_mod_info_map {
            for (&load, mod_infos) in self.load_to_mod_info.iter() {
                info!("Load to mod infos";
                      "load" => self.inst_str(load),
                      "mod_infos" => mod_infos.iter().map(|m| self.mod_info_str(m)).join("; "));
            }
        }
        if dumps.mod_info_to_store_map {
            for (mod_info, stores) in self.mod_info_to_store.iter() {
                info!("Mod info to stores";
                      "mod_info" => self.mod_info_str(mod_info),
                      "stores" => self.insts_str(stores));
            }
        }
        if dumps.mod_info_to_id_map {
            for (mod_info, id) in self.mod_info_to_id.iter() {
                info!("Mod info to id"; "mod_info" => self.mod_info_str(mod_info), "id" => id);
            }
        }
        if dumps.overriding_stores {
            info!("Overriding stores"; "stores" => self.insts_str(&self.overriding_stores));
        }
    }
}
