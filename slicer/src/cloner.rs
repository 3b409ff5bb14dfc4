//! Per-slice copies of the code reachable from each target function.
//!
//! Every clone, and the map translating its instructions back to the original, lives in an arena
//! owned by the [`Cloner`]. Clones are handed out by reference only; dropping the cloner releases
//! all of them. Clones are never inserted into the program; a consumer that wants to materialize
//! one does so itself (see [`Program::insert_function`](crate::il::Program::insert_function)).

use std::rc::Rc;

use itertools::Itertools;

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::il::{Function, FunctionId, InstId, Value};
use crate::log::*;
use crate::mod_ref::{ModRefAnalysis, SliceId};

/// Maps each instruction of a clone to the original instruction it was copied from
pub type ValueTranslationMap = UnorderedMap<InstId, InstId>;

struct CloneEntry {
    function: Function,
    original: FunctionId,
    slice_id: SliceId,
    translation_map: ValueTranslationMap,
}

/// Book-keeping for the clone of a function for a particular slice.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SliceInfo {
    /// Index into the cloner's arena
    handle: usize,
    is_sliced: bool,
}

impl SliceInfo {
    /// Whether the slice has already been handed to (and successfully processed by) the annotator
    pub fn is_sliced(&self) -> bool {
        self.is_sliced
    }
}

/// A view on one clone owned by the [`Cloner`]
#[derive(Clone, Copy, Debug)]
pub struct Slice<'a> {
    pub original: FunctionId,
    pub slice_id: SliceId,
    pub function: &'a Function,
    pub translation_map: &'a ValueTranslationMap,
    pub is_sliced: bool,
}

/// Where a clone came from
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CloneInfo {
    pub original: FunctionId,
    pub slice_id: SliceId,
}

pub struct Cloner {
    mod_ref: Rc<ModRefAnalysis>,
    clones: Vec<CloneEntry>,
    /// Slices of each original function, by slice id
    function_map: UnorderedMap<FunctionId, UnorderedMap<SliceId, SliceInfo>>,
    /// Arena handle of each clone, by the clone's id
    clone_info: UnorderedMap<FunctionId, usize>,
    /// Reachable closure of each target function
    reachability_map: UnorderedMap<FunctionId, Rc<UnorderedSet<FunctionId>>>,
    next_function_id: usize,
}

impl Cloner {
    /// Clone, for every side effect found by `mod_ref`, each function reachable from the side
    /// effect's target.
    pub fn run(mod_ref: Rc<ModRefAnalysis>) -> Self {
        let next_function_id = mod_ref.program().fresh_function_id_bound();
        let mut r = Self {
            mod_ref,
            clones: vec![],
            function_map: Default::default(),
            clone_info: Default::default(),
            reachability_map: Default::default(),
            next_function_id,
        };

        let mod_ref = r.mod_ref.clone();
        let program = mod_ref.program();
        for side_effect in mod_ref.side_effects() {
            let f = side_effect.function();
            let slice_id = side_effect.slice_id();

            let reachable = match r.reachability_map.get(&f) {
                Some(reachable) => reachable.clone(),
                None => {
                    let reachable = mod_ref.reachability().reachable_from(program, f);
                    debug!("Reachable functions";
                           "target" => program.function(f).map(|f| f.name.as_str()).unwrap_or("?"),
                           "count" => reachable.len());
                    r.reachability_map.insert(f, reachable.clone());
                    reachable
                }
            };

            for &g in reachable.iter() {
                let func = match program.function(g) {
                    Some(func) if !func.is_declaration() => func,
                    _ => continue,
                };
                if r.get_slice(g, slice_id).is_some() {
                    continue;
                }
                r.clone_function(func, slice_id);
            }
        }

        r
    }

    /// Clone `func` for slice `slice_id`, returning the clone's id
    fn clone_function(&mut self, func: &Function, slice_id: SliceId) -> FunctionId {
        info!("cloning"; "function" => &func.name, "slice_id" => slice_id);

        let new_id = FunctionId(self.next_function_id);
        self.next_function_id += 1;
        let (function, correspondence) =
            func.clone_structurally(new_id, format!("{}_clone_{}", func.name, slice_id));
        let translation_map = correspondence
            .into_iter()
            .map(|(original, cloned)| (cloned, original))
            .collect();

        let handle = self.clones.len();
        self.clones.push(CloneEntry {
            function,
            original: func.id,
            slice_id,
            translation_map,
        });
        self.clone_info.insert(new_id, handle);
        let previous = self.function_map.entry(func.id).or_default().insert(
            slice_id,
            SliceInfo {
                handle,
                is_sliced: false,
            },
        );
        assert!(
            previous.is_none(),
            "{} cloned twice for slice {}",
            func.name,
            slice_id
        );
        new_id
    }

    fn view(&self, info: &SliceInfo) -> Slice<'_> {
        let entry = &self.clones[info.handle];
        Slice {
            original: entry.original,
            slice_id: entry.slice_id,
            function: &entry.function,
            translation_map: &entry.translation_map,
            is_sliced: info.is_sliced,
        }
    }

    /// Translate a value in some clone to the corresponding value in the original program.
    ///
    /// Values that are not instructions, and instructions of functions not cloned by this cloner,
    /// are returned as they are. Returns `None` if `v` is an instruction of a clone that has no
    /// original counterpart.
    pub fn translate_value(&self, v: &Value) -> Option<Value> {
        let inst = match v.as_inst() {
            Some(inst) => inst,
            None => return Some(v.clone()),
        };
        match self.clone_info.get(&inst.function) {
            Some(&handle) => self.clones[handle]
                .translation_map
                .get(&inst)
                .map(|&original| Value::Inst(original)),
            None => Some(v.clone()),
        }
    }

    /// All slices of `f`, ordered by slice id
    pub fn get_slices(&self, f: FunctionId) -> Option<Vec<Slice<'_>>> {
        let slices = self.function_map.get(&f)?;
        Some(
            slices
                .iter()
                .sorted_by_key(|(id, _)| **id)
                .map(|(_, info)| self.view(info))
                .collect(),
        )
    }

    /// The slice `slice_id` of `f`
    pub fn get_slice(&self, f: FunctionId, slice_id: SliceId) -> Option<Slice<'_>> {
        let info = self.function_map.get(&f)?.get(&slice_id)?;
        Some(self.view(info))
    }

    /// Where the clone `cloned` came from, if it is a clone made by this cloner
    pub fn get_clone_info(&self, cloned: FunctionId) -> Option<CloneInfo> {
        let entry = &self.clones[*self.clone_info.get(&cloned)?];
        Some(CloneInfo {
            original: entry.original,
            slice_id: entry.slice_id,
        })
    }

    /// Record that slice `slice_id` of `f` has been annotated.
    ///
    /// Panics if no such slice was cloned.
    pub fn mark_as_sliced(&mut self, f: FunctionId, slice_id: SliceId) {
        let info = self
            .function_map
            .get_mut(&f)
            .and_then(|slices| slices.get_mut(&slice_id))
            .unwrap_or_else(|| panic!("No slice {} of {:?} to mark", slice_id, f));
        info.is_sliced = true;
    }

    /// Reachable closure of each target function that had side effects
    pub fn reachability_map(&self) -> &UnorderedMap<FunctionId, Rc<UnorderedSet<FunctionId>>> {
        &self.reachability_map
    }

    pub fn mod_ref(&self) -> &Rc<ModRefAnalysis> {
        &self.mod_ref
    }

    /// Total number of clones made
    pub fn num_clones(&self) -> usize {
        self.clones.len()
    }
}

impl std::fmt::Debug for Cloner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for entry in &self.clones {
            write!(f, "{:?}", entry.function)?;
        }
        Ok(())
    }
}
