//! Hands each side effect's clone over to an external [`Annotator`], which prunes it down to what
//! matters for that side effect.

use std::rc::Rc;

use crate::cloner::{Cloner, ValueTranslationMap};
use crate::config::SlicerConfig;
use crate::containers::unordered::UnorderedSet;
use crate::error::SlicerError;
use crate::il::{Callee, Function, FunctionId, InstKind};
use crate::log::*;
use crate::mod_ref::{ModRefAnalysis, SideEffectKind, SliceId};

/// A consumer of slices. Called with the target's clone for a slice that is not yet marked as
/// sliced; a slice is never handed over again once annotated.
pub trait Annotator {
    fn annotate(
        &mut self,
        cloned: &Function,
        translation_map: &ValueTranslationMap,
        slice_id: SliceId,
        kind: SideEffectKind,
    ) -> Result<(), String>;
}

pub struct SliceGenerator<A: Annotator> {
    cloner: Cloner,
    annotator: A,
    lazy: bool,
}

impl<A: Annotator> SliceGenerator<A> {
    pub fn new(cloner: Cloner, annotator: A, config: &SlicerConfig) -> Self {
        Self {
            cloner,
            annotator,
            lazy: config.lazy,
        }
    }

    fn mod_ref(&self) -> Rc<ModRefAnalysis> {
        self.cloner.mod_ref().clone()
    }

    fn function_name(&self, f: FunctionId) -> String {
        self.cloner
            .mod_ref()
            .program()
            .function(f)
            .map(|func| func.name.clone())
            .unwrap_or_else(|| format!("{:?}", f))
    }

    /// Generate the slice of every side effect, unless slices are generated lazily (see
    /// [`Self::ensure_slice`]).
    pub fn generate(&mut self) -> Result<(), SlicerError> {
        if self.lazy {
            debug!("Deferring slice generation until first demand");
            return Ok(());
        }
        let mod_ref = self.mod_ref();
        for side_effect in mod_ref.side_effects() {
            self.generate_slice(
                side_effect.function(),
                side_effect.slice_id(),
                side_effect.kind(),
            )?;
        }
        Ok(())
    }

    /// Annotate the clone of `f` for `slice_id`, unless that has already been done. Returns
    /// whether the slice is annotated by the time this returns. A failed annotation is logged and
    /// leaves the slice unmarked; it is not attempted again.
    ///
    /// Errors out if the cloner never produced such a clone.
    pub fn generate_slice(
        &mut self,
        f: FunctionId,
        slice_id: SliceId,
        kind: SideEffectKind,
    ) -> Result<bool, SlicerError> {
        let slice = match self.cloner.get_slice(f, slice_id) {
            Some(slice) => slice,
            None => {
                let function = self.function_name(f);
                crit!("Slice requested before cloning"; "function" => &function, "slice_id" => slice_id);
                return Err(SlicerError::SliceNotCloned { function, slice_id });
            }
        };
        if slice.is_sliced {
            return Ok(true);
        }

        match self
            .annotator
            .annotate(slice.function, slice.translation_map, slice_id, kind)
        {
            Ok(()) => {
                debug!("Generated slice"; "function" => &slice.function.name, "slice_id" => slice_id);
                self.cloner.mark_as_sliced(f, slice_id);
                Ok(true)
            }
            Err(e) => {
                warn!("Annotation failed";
                      "function" => &slice.function.name, "slice_id" => slice_id, "err" => e);
                Ok(false)
            }
        }
    }

    /// Make sure the slice `slice_id` of target `f` has been generated, generating it now if
    /// needed.
    ///
    /// Errors out if `f` has no side effect with id `slice_id`, or if its clone is missing.
    pub fn ensure_slice(&mut self, f: FunctionId, slice_id: SliceId) -> Result<bool, SlicerError> {
        let kind = match self.mod_ref().side_effect(slice_id) {
            Some(side_effect) if side_effect.function() == f => side_effect.kind(),
            _ => {
                let function = self.function_name(f);
                crit!("No such side effect"; "function" => &function, "slice_id" => slice_id);
                return Err(SlicerError::NoSuchSideEffect { function, slice_id });
            }
        };
        self.generate_slice(f, slice_id, kind)
    }

    /// Whether slice `slice_id` of `f` has been annotated
    pub fn is_sliced(&self, f: FunctionId, slice_id: SliceId) -> bool {
        self.cloner
            .get_slice(f, slice_id)
            .map_or(false, |slice| slice.is_sliced)
    }

    /// Render the clone of `f` for `slice_id`. If `recursively`, also render the clones (for the
    /// same slice) of every function it directly calls, transitively.
    pub fn dump_slice(&self, f: FunctionId, slice_id: SliceId, recursively: bool) -> Option<String> {
        let mut out = String::new();
        let mut seen = UnorderedSet::new();
        let mut stack = vec![f];
        while let Some(f) = stack.pop() {
            if !seen.insert(f) {
                continue;
            }
            let slice = match self.cloner.get_slice(f, slice_id) {
                Some(slice) => slice,
                None if out.is_empty() => return None,
                None => continue,
            };
            out += &format!("{:?}", slice.function);
            if !recursively {
                break;
            }
            for ins in slice.function.instructions() {
                if let InstKind::Call {
                    callee: Callee::Direct(g),
                    ..
                } = ins.kind
                {
                    stack.push(g);
                }
            }
        }
        Some(out)
    }

    /// Log the (recursive) slice of every side effect
    pub fn dump_slices(&self) {
        let mod_ref = self.mod_ref();
        for side_effect in mod_ref.side_effects() {
            let f = side_effect.function();
            if let Some(dump) = self.dump_slice(f, side_effect.slice_id(), true) {
                info!("Slice";
                      "function" => self.function_name(f),
                      "slice_id" => side_effect.slice_id(),
                      "kind" => ?side_effect.kind(),
                      "is_sliced" => self.is_sliced(f, side_effect.slice_id()),
                      "body" => dump);
            }
        }
    }

    pub fn cloner(&self) -> &Cloner {
        &self.cloner
    }

    pub fn annotator(&self) -> &A {
        &self.annotator
    }

    pub fn annotator_mut(&mut self) -> &mut A {
        &mut self.annotator
    }
}
