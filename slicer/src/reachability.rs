//! Call-graph reachability over the [`Program`], resolving indirect calls by signature.
//!
//! Running the analysis trims the program down to what is reachable from its entry point. All
//! later analyses thus only ever see the reachable closure.

use std::cell::RefCell;
use std::rc::Rc;

use itertools::Itertools;

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::SlicerError;
use crate::il::{Callee, FunctionId, InstKind, Program, Signature, Use};
use crate::log::*;

/// Results of the reachability analysis
#[derive(Debug)]
pub struct ReachabilityAnalysis {
    /// The function the program starts at
    entry: FunctionId,
    /// Functions that may be called indirectly, grouped by signature
    function_type_map: UnorderedMap<Signature, UnorderedSet<FunctionId>>,
    /// Functions reachable from `entry`
    reachable: UnorderedSet<FunctionId>,
    /// Memoized reachable closures, keyed by starting function
    cache: RefCell<UnorderedMap<FunctionId, Rc<UnorderedSet<FunctionId>>>>,
}

impl ReachabilityAnalysis {
    /// Compute the functions reachable from the function named `entry`, and remove every other
    /// function from `program`.
    pub fn run(program: &mut Program, entry: &str) -> Result<Self, SlicerError> {
        let entry_id = program.function_by_name(entry).ok_or_else(|| {
            crit!("Entry function not found"; "entry" => entry);
            SlicerError::EntryNotFound(entry.to_owned())
        })?;

        let mut r = Self {
            entry: entry_id,
            function_type_map: Self::compute_function_type_map(program),
            reachable: Default::default(),
            cache: Default::default(),
        };

        let mut reachable = UnorderedSet::new();
        r.compute_reachable_functions(program, entry_id, &mut reachable);
        r.reachable = reachable;
        r.remove_unreachable_functions(program);

        // Signature table entries for removed functions would resurrect them as call targets.
        let reachable = &r.reachable;
        r.function_type_map.values_mut().for_each(|fs| {
            *fs = fs.iter().filter(|f| reachable.contains(*f)).cloned().collect()
        });
        r.function_type_map.retain(|_, fs| !fs.is_empty());

        r.dump_reachable_functions(program);
        Ok(r)
    }

    /// The program's entry point
    pub fn entry(&self) -> FunctionId {
        self.entry
    }

    /// All functions reachable from the entry point. After [`Self::run`], these are exactly the
    /// functions left in the program.
    pub fn reachable_functions(&self) -> &UnorderedSet<FunctionId> {
        &self.reachable
    }

    /// Functions that may be the target of an indirect call, grouped by signature
    pub fn function_type_map(&self) -> &UnorderedMap<Signature, UnorderedSet<FunctionId>> {
        &self.function_type_map
    }

    /// Add to `results` every function transitively reachable from `start` (including `start`
    /// itself). Declarations are included, but (lacking a body) not expanded further.
    pub fn compute_reachable_functions(
        &self,
        program: &Program,
        start: FunctionId,
        results: &mut UnorderedSet<FunctionId>,
    ) {
        let mut stack: Vec<FunctionId> = vec![start];
        let mut pushed: UnorderedSet<FunctionId> = std::iter::once(start).collect();
        results.insert(start);

        while let Some(f) = stack.pop() {
            let func = match program.function(f) {
                Some(func) => func,
                None => {
                    debug!("Reachable function missing from program"; "function" => ?f);
                    continue;
                }
            };
            for ins in func.instructions() {
                let callee = match &ins.kind {
                    InstKind::Call { callee, .. } => callee,
                    _ => continue,
                };
                for target in self.call_targets(callee) {
                    results.insert(target);
                    let is_declaration = program
                        .function(target)
                        .map_or(true, |t| t.is_declaration());
                    if is_declaration {
                        continue;
                    }
                    if pushed.insert(target) {
                        stack.push(target);
                    }
                }
            }
        }
    }

    /// The reachable closure of `start`, computed once and memoized.
    pub fn reachable_from(
        &self,
        program: &Program,
        start: FunctionId,
    ) -> Rc<UnorderedSet<FunctionId>> {
        if let Some(r) = self.cache.borrow().get(&start) {
            return r.clone();
        }
        let mut results = UnorderedSet::new();
        self.compute_reachable_functions(program, start, &mut results);
        let results = Rc::new(results);
        self.cache.borrow_mut().insert(start, results.clone());
        results
    }

    /// Potential targets of a call to `callee`. Indirect calls may reach any possibly-virtual
    /// function with exactly the signature of the called pointer.
    fn call_targets(&self, callee: &Callee) -> Vec<FunctionId> {
        match callee {
            Callee::Direct(f) => vec![*f],
            Callee::Indirect { signature, .. } => {
                let targets: Vec<FunctionId> = self
                    .function_type_map
                    .get(signature)
                    .map(|fs| fs.iter().cloned().collect())
                    .unwrap_or_default();
                trace!("Indirect call"; "signature" => ?signature, "count" => targets.len());
                targets
            }
        }
    }

    /// Whether `f` may be called indirectly: it has a use other than being directly called, or is
    /// passed as an argument to a call.
    pub fn is_virtual(program: &Program, f: FunctionId) -> bool {
        program.uses_of(f).into_iter().any(|u| match u {
            Use::DirectCallee { .. } => false,
            Use::CallArgument { .. } | Use::Operand { .. } | Use::GlobalInitializer { .. } => true,
        })
    }

    fn compute_function_type_map(
        program: &Program,
    ) -> UnorderedMap<Signature, UnorderedSet<FunctionId>> {
        let mut map: UnorderedMap<Signature, UnorderedSet<FunctionId>> = Default::default();
        for func in program.functions() {
            if Self::is_virtual(program, func.id) {
                map.entry(func.signature.clone())
                    .or_default()
                    .insert(func.id);
            }
        }
        map
    }

    fn remove_unreachable_functions(&self, program: &mut Program) {
        let unreachable: Vec<FunctionId> = program
            .functions()
            .map(|f| f.id)
            .filter(|f| !self.reachable.contains(f))
            .collect();
        for f in unreachable {
            program.replace_all_uses_with_undef(f);
            program.erase_function(f);
        }
    }

    fn dump_reachable_functions(&self, program: &Program) {
        info!(
            "Reachable functions";
            "count" => self.reachable.len(),
            "functions" => self
                .reachable
                .iter()
                .filter_map(|&f| program.function(f))
                .map(|f| &f.name)
                .sorted()
                .join(", "),
        );
    }
}

impl ReachabilityAnalysis {
    /// Write the call graph between reachable functions as a GraphViz `.dot` file to `w`. Indirect
    /// call edges are dashed.
    pub fn write_dot<W: std::io::Write>(&self, program: &Program, w: &mut W) -> std::io::Result<()> {
        type Node = FunctionId;
        type Edge = (FunctionId, FunctionId, bool);

        struct Graph<'a> {
            ra: &'a ReachabilityAnalysis,
            program: &'a Program,
        }

        impl<'a> dot::Labeller<'a, Node, Edge> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("CallGraph").unwrap()
            }
            fn node_id(&'a self, n: &Node) -> dot::Id<'a> {
                dot::Id::new(format!("f{}", n.0)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &Node) -> dot::LabelText<'b> {
                match self.program.function(*n) {
                    Some(f) => dot::LabelText::label(f.name.clone()),
                    None => dot::LabelText::label(format!("{:?}", n)),
                }
            }
            fn node_shape(&'a self, n: &Node) -> Option<dot::LabelText<'a>> {
                if *n == self.ra.entry {
                    Some(dot::LabelText::label("doublecircle"))
                } else if self.program.function(*n).map_or(true, |f| f.is_declaration()) {
                    Some(dot::LabelText::label("box"))
                } else {
                    None
                }
            }
            fn edge_style(&'a self, e: &Edge) -> dot::Style {
                if e.2 {
                    dot::Style::Dashed
                } else {
                    dot::Style::None
                }
            }
        }

        fn get_edges(g: &Graph) -> Vec<Edge> {
            let mut edges: UnorderedSet<Edge> = Default::default();
            for &f in g.ra.reachable.iter() {
                let func = match g.program.function(f) {
                    Some(func) => func,
                    None => continue,
                };
                for ins in func.instructions() {
                    if let InstKind::Call { callee, .. } = &ins.kind {
                        let indirect = matches!(callee, Callee::Indirect { .. });
                        for t in g.ra.call_targets(callee) {
                            edges.insert((f, t, indirect));
                        }
                    }
                }
            }
            edges.into_iter().collect()
        }

        impl<'a> dot::GraphWalk<'a, Node, Edge> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, Node> {
                self.ra.reachable.iter().cloned().collect::<Vec<_>>().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                get_edges(self).into()
            }
            fn source(&self, e: &Edge) -> Node {
                e.0
            }
            fn target(&self, e: &Edge) -> Node {
                e.1
            }
        }

        dot::render(&Graph { ra: self, program }, w)
    }

    /// Generate a `.dot` file representing the reachable call graph
    pub fn generate_dot(&self, program: &Program) -> String {
        let mut s: Vec<u8> = vec![];
        self.write_dot(program, &mut s).unwrap();
        String::from_utf8(s).unwrap()
    }
}
