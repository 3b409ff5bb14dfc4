use crate::cloner::ValueTranslationMap;
use crate::il::{
    Callee, Function, FunctionId, GlobalId, InstId, InstKind, Opcode, Program, Signature, Type,
    Value,
};
use crate::mod_ref::{SideEffectKind, SliceId};
use crate::points_to::{AllocationSite, Offset, PointsToTable};
use crate::slice_generator::Annotator;

#[cfg(test)]
use crate::config::{CommandLineSlicerConfig, SlicerConfig};
#[cfg(test)]
use crate::containers::unordered::UnorderedSet;
#[cfg(test)]
use crate::error::SlicerError;
#[cfg(test)]
use crate::mod_ref::{ModInfo, SideEffect};
#[cfg(test)]
use crate::pipeline::{self, Slicer};
#[cfg(test)]
use crate::points_to::PointsToOracle;

#[cfg(test)]
fn assert_unorderedset_eq<T: Eq + std::hash::Hash + Ord + std::fmt::Debug>(
    a: impl IntoIterator<Item = T>,
    b: impl IntoIterator<Item = T>,
) {
    let a: UnorderedSet<_> = a.into_iter().collect();
    let b: UnorderedSet<_> = b.into_iter().collect();
    assert_eq!(a, b)
}

fn void() -> Signature {
    Signature::new([], Type::Void)
}

fn int() -> Signature {
    Signature::new([], Type::Integer { bits: 32 })
}

fn call(prog: &mut Program, f: FunctionId, args: Vec<Value>) -> Value {
    prog.push(InstKind::Call {
        callee: Callee::Direct(f),
        args,
    })
}

fn store(prog: &mut Program, address: Value, value: u64) -> Value {
    prog.push(InstKind::Store {
        address,
        value: Value::Constant { value, size: 4 },
    })
}

fn ret(prog: &mut Program, value: Option<u64>) {
    prog.push(InstKind::Return {
        value: value.map(|value| Value::Constant { value, size: 4 }),
    });
}

/// `main -> a -> b`, where `b` writes the global `g` and `main` reads it afterwards. `unused`
/// also writes `g`, but is never called.
pub fn call_chain_program(a_returns_value: bool) -> Program {
    let mut prog = Program::new();
    let g = Value::Global(prog.add_global("g", []));

    let b = prog.begin_function("b", void());
    store(&mut prog, g.clone(), 1);
    ret(&mut prog, None);
    prog.end_function();

    let a = prog.begin_function("a", if a_returns_value { int() } else { void() });
    call(&mut prog, b, vec![]);
    ret(&mut prog, if a_returns_value { Some(0) } else { None });
    prog.end_function();

    prog.begin_function("main", void());
    call(&mut prog, a, vec![]);
    prog.push(InstKind::Load { address: g.clone() });
    ret(&mut prog, None);
    prog.end_function();

    prog.begin_function("unused", void());
    store(&mut prog, g, 2);
    ret(&mut prog, None);
    prog.end_function();

    prog
}

/// `main` calls `t` and `outer`.
///
/// - `t` calls `helper`, which writes (and reads) a stack slot of its own, and `t` then writes the
///   global `g` that `main` reads.
/// - `outer` allocates a stack slot `o` and passes it to `rec_target`, which writes through it and
///   may call `outer` again. `outer` reads `o` after the call.
pub fn stack_escape_program() -> (Program, PointsToTable) {
    let mut prog = Program::new();
    let g = Value::Global(prog.add_global("g", []));

    let helper = prog.begin_function("helper", void());
    let slot = prog.push(InstKind::Alloca { size: 4 });
    store(&mut prog, slot.clone(), 1);
    prog.push(InstKind::Load { address: slot });
    ret(&mut prog, None);
    prog.end_function();

    let t = prog.begin_function("t", void());
    call(&mut prog, helper, vec![]);
    store(&mut prog, g.clone(), 1);
    ret(&mut prog, None);
    prog.end_function();

    let rec_target =
        prog.declare_function("rec_target", Signature::new([Type::Pointer], Type::Void));

    let outer = prog.begin_function("outer", void());
    let o = prog.push(InstKind::Alloca { size: 4 });
    call(&mut prog, rec_target, vec![o.clone()]);
    prog.push(InstKind::Load { address: o.clone() });
    ret(&mut prog, None);
    prog.end_function();

    prog.define_function(rec_target);
    let p = prog.argument(0);
    store(&mut prog, p.clone(), 1);
    let cond = prog.push(InstKind::Load { address: g.clone() });
    prog.push(InstKind::Branch {
        condition: Some(cond),
        targets: vec![1, 2],
    });
    prog.add_block();
    call(&mut prog, outer, vec![]);
    ret(&mut prog, None);
    prog.add_block();
    ret(&mut prog, None);
    prog.end_function();

    prog.begin_function("main", void());
    call(&mut prog, t, vec![]);
    call(&mut prog, outer, vec![]);
    prog.push(InstKind::Load { address: g });
    ret(&mut prog, None);
    prog.end_function();

    let mut pts = PointsToTable::with_direct_objects(&prog);
    let o_loc = pts
        .location_of(&AllocationSite {
            value: o,
            offset: Offset::Known(0),
        })
        .unwrap();
    pts.add_points_to(p, o_loc);
    (prog, pts)
}

/// `main` passes `dec` to `dispatch`, which calls through the pointer it is given. `inc` sits in a
/// global table, so it may be called indirectly too; `lonely` has the same signature but is never
/// used. All three write `counter`, which `main` reads.
pub fn indirect_call_program() -> Program {
    let mut prog = Program::new();
    let counter = Value::Global(prog.add_global("counter", []));

    let inc = prog.begin_function("inc", void());
    store(&mut prog, counter.clone(), 1);
    ret(&mut prog, None);
    prog.end_function();

    let dec = prog.begin_function("dec", void());
    store(&mut prog, counter.clone(), 0);
    ret(&mut prog, None);
    prog.end_function();

    prog.begin_function("lonely", void());
    store(&mut prog, counter.clone(), 7);
    ret(&mut prog, None);
    prog.end_function();

    prog.add_global("table", [Value::Function(inc)]);

    let dispatch = prog.begin_function(
        "dispatch",
        Signature::new([Type::Pointer], Type::Integer { bits: 32 }),
    );
    let fp = prog.argument(0);
    prog.push(InstKind::Call {
        callee: Callee::Indirect {
            pointer: fp,
            signature: void(),
        },
        args: vec![],
    });
    ret(&mut prog, Some(0));
    prog.end_function();

    prog.begin_function("main", void());
    call(&mut prog, dispatch, vec![Value::Function(dec)]);
    prog.push(InstKind::Load { address: counter });
    ret(&mut prog, None);
    prog.end_function();

    prog
}

/// An annotator that records what it was given
#[derive(Default, Debug)]
pub struct RecordingAnnotator {
    pub annotated: Vec<(String, SliceId, SideEffectKind)>,
    /// Reject every slice
    pub failing: bool,
    /// Number of calls, failed ones included
    pub attempts: usize,
}

impl Annotator for RecordingAnnotator {
    fn annotate(
        &mut self,
        cloned: &Function,
        translation_map: &ValueTranslationMap,
        slice_id: SliceId,
        kind: SideEffectKind,
    ) -> Result<(), String> {
        self.attempts += 1;
        if self.failing {
            return Err(format!("refusing to annotate {}", cloned.name));
        }
        assert_eq!(translation_map.len(), cloned.instructions.len());
        self.annotated.push((cloned.name.clone(), slice_id, kind));
        Ok(())
    }
}

/// The site of the object of global `g`, as seeded by [`PointsToTable::with_direct_objects`]
pub fn global_site(g: usize) -> AllocationSite {
    AllocationSite {
        value: Value::Global(GlobalId(g)),
        offset: Offset::Known(0),
    }
}

/// The first instruction of kind `opcode` in the function named `name`
pub fn find_inst(prog: &Program, name: &str, opcode: Opcode) -> InstId {
    let f = prog.function_by_name(name).unwrap();
    prog.function(f)
        .unwrap()
        .instructions()
        .find(|i| i.opcode() == opcode)
        .unwrap()
        .id
}

#[cfg(test)]
fn run_slicer(
    prog: Program,
    pts: &PointsToTable,
    targets: &[&str],
    lazy: bool,
) -> Result<Slicer<RecordingAnnotator>, SlicerError> {
    let mut config = SlicerConfig::new("main", targets.iter().copied());
    config.lazy = lazy;
    pipeline::run(prog, pts, RecordingAnnotator::default(), &config)
}

#[cfg(test)]
fn id(slicer: &Slicer<RecordingAnnotator>, name: &str) -> FunctionId {
    slicer.program.function_by_name(name).unwrap()
}

#[cfg(test)]
fn slice_name(slicer: &Slicer<RecordingAnnotator>, name: &str, slice_id: SliceId) -> Option<String> {
    slicer
        .slice_generator
        .cloner()
        .get_slice(id(slicer, name), slice_id)
        .map(|s| s.function.name.clone())
}

#[test]
fn call_chain_with_void_target() {
    let prog = call_chain_program(false);
    let pts = PointsToTable::with_direct_objects(&prog);
    let slicer = run_slicer(prog, &pts, &["a"], false).unwrap();
    let (a, b, main) = (id(&slicer, "a"), id(&slicer, "b"), id(&slicer, "main"));

    assert!(slicer.program.function_by_name("unused").is_none());

    let cloner = slicer.slice_generator.cloner();
    assert_unorderedset_eq(cloner.reachability_map().get(&a).unwrap().iter().copied(), [a, b]);

    let mod_ref = &slicer.mod_ref;
    let g_write = ModInfo {
        function: a,
        site: global_site(0),
    };
    assert_eq!(
        mod_ref.side_effects(),
        &[SideEffect::Modifier {
            mod_info: g_write.clone(),
            slice_id: 1
        }]
    );
    assert_eq!(mod_ref.ret_slice_id(a), None);
    assert_eq!(mod_ref.mod_info_to_id_map().get(&g_write), Some(&1));

    let b_store = find_inst(&slicer.program, "b", Opcode::Store);
    let main_load = find_inst(&slicer.program, "main", Opcode::Load);
    assert_unorderedset_eq(mod_ref.mod_set(a).unwrap().iter().copied(), [b_store]);
    assert_unorderedset_eq(mod_ref.mod_info_to_store_map().get(&g_write).unwrap().iter().copied(), [b_store]);
    assert!(mod_ref.may_block(main_load));
    assert!(mod_ref.may_override(b_store));
    assert_unorderedset_eq(mod_ref.blocking_stores(main_load).unwrap().iter().copied(), [b_store]);
    assert_unorderedset_eq(
        mod_ref.approximate_mod_infos(main_load, &global_site(0)),
        [g_write],
    );

    assert_eq!(cloner.num_clones(), 2);
    assert_eq!(slice_name(&slicer, "a", 1).as_deref(), Some("a_clone_1"));
    assert_eq!(slice_name(&slicer, "b", 1).as_deref(), Some("b_clone_1"));
    assert!(cloner.get_slices(main).is_none());

    assert_eq!(
        slicer.slice_generator.annotator().annotated,
        vec![("a_clone_1".to_string(), 1, SideEffectKind::Modifier)]
    );
    assert!(slicer.slice_generator.is_sliced(a, 1));
    assert!(!slicer.slice_generator.is_sliced(b, 1));
}

#[test]
fn call_chain_with_value_returning_target() {
    let prog = call_chain_program(true);
    let pts = PointsToTable::with_direct_objects(&prog);
    let slicer = run_slicer(prog, &pts, &["a"], false).unwrap();
    let a = id(&slicer, "a");

    assert_eq!(
        slicer.mod_ref.side_effects(),
        &[
            SideEffect::ReturnValue {
                function: a,
                slice_id: 1
            },
            SideEffect::Modifier {
                mod_info: ModInfo {
                    function: a,
                    site: global_site(0)
                },
                slice_id: 2
            }
        ]
    );
    assert_eq!(slicer.mod_ref.ret_slice_id(a), Some(1));

    let cloner = slicer.slice_generator.cloner();
    assert_eq!(cloner.num_clones(), 4);
    let a_slices: Vec<_> = cloner
        .get_slices(a)
        .unwrap()
        .into_iter()
        .map(|s| (s.slice_id, s.function.name.clone()))
        .collect();
    assert_eq!(
        a_slices,
        vec![(1, "a_clone_1".to_string()), (2, "a_clone_2".to_string())]
    );
    assert_eq!(
        slicer.slice_generator.annotator().annotated,
        vec![
            ("a_clone_1".to_string(), 1, SideEffectKind::ReturnValue),
            ("a_clone_2".to_string(), 2, SideEffectKind::Modifier),
        ]
    );
}

#[test]
fn void_target_without_observed_writes_has_no_side_effects() {
    let mut prog = Program::new();
    let h = Value::Global(prog.add_global("h", []));
    let quiet = prog.begin_function("quiet", void());
    let local = prog.push(InstKind::Alloca { size: 4 });
    store(&mut prog, local, 1);
    store(&mut prog, h, 1);
    ret(&mut prog, None);
    prog.end_function();
    prog.begin_function("main", void());
    call(&mut prog, quiet, vec![]);
    ret(&mut prog, None);
    prog.end_function();

    let pts = PointsToTable::with_direct_objects(&prog);
    let slicer = run_slicer(prog, &pts, &["quiet"], false).unwrap();
    let quiet = id(&slicer, "quiet");

    assert_eq!(slicer.mod_ref.mod_pts(quiet).unwrap().len(), 2);
    assert!(slicer.mod_ref.mod_set(quiet).unwrap().is_empty());
    assert!(slicer.mod_ref.side_effects().is_empty());
    assert!(slicer.mod_ref.overriding_stores().is_empty());
    assert_eq!(slicer.slice_generator.cloner().num_clones(), 0);
    assert!(slicer.slice_generator.cloner().get_slices(quiet).is_none());
    assert!(slicer.slice_generator.annotator().annotated.is_empty());
}

#[test]
fn stack_objects_that_cannot_reach_the_target_are_not_side_effects() {
    let (prog, pts) = stack_escape_program();
    let slot_site = AllocationSite {
        value: Value::Inst(find_inst(&prog, "helper", Opcode::Other)),
        offset: Offset::Known(0),
    };
    let o_site = AllocationSite {
        value: Value::Inst(find_inst(&prog, "outer", Opcode::Other)),
        offset: Offset::Known(0),
    };
    let slot = pts.location_of(&slot_site).unwrap();
    let o = pts.location_of(&o_site).unwrap();

    let slicer = run_slicer(prog, &pts, &["t", "rec_target"], false).unwrap();
    let (t, rec_target) = (id(&slicer, "t"), id(&slicer, "rec_target"));
    let mod_ref = &slicer.mod_ref;

    // `helper`'s slot is read, but `helper` cannot reach `t` again
    assert!(mod_ref.ref_pts().contains(&slot));
    assert!(!mod_ref.mod_pts(t).unwrap().contains(&slot));
    let helper_store = find_inst(&slicer.program, "helper", Opcode::Store);
    assert!(!mod_ref.mod_set(t).unwrap().contains(&helper_store));

    // `outer` may be re-entered through `rec_target`
    assert!(mod_ref.mod_pts(rec_target).unwrap().contains(&o));
    let rec_store = find_inst(&slicer.program, "rec_target", Opcode::Store);
    assert_unorderedset_eq(mod_ref.mod_set(rec_target).unwrap().iter().copied(), [rec_store]);

    assert_eq!(
        mod_ref.side_effects(),
        &[
            SideEffect::Modifier {
                mod_info: ModInfo {
                    function: t,
                    site: global_site(0)
                },
                slice_id: 1
            },
            SideEffect::Modifier {
                mod_info: ModInfo {
                    function: rec_target,
                    site: o_site.clone()
                },
                slice_id: 2
            }
        ]
    );

    let outer_load = find_inst(&slicer.program, "outer", Opcode::Load);
    assert!(mod_ref.may_block(outer_load));
    assert_unorderedset_eq(
        mod_ref.approximate_mod_infos(outer_load, &o_site),
        [ModInfo {
            function: rec_target,
            site: o_site,
        }],
    );
    assert!(mod_ref
        .approximate_mod_infos(outer_load, &global_site(0))
        .is_empty());

    // Clones of `rec_target`'s closure also include `outer`
    assert_eq!(slice_name(&slicer, "outer", 2).as_deref(), Some("outer_clone_2"));
    assert_eq!(slice_name(&slicer, "helper", 1).as_deref(), Some("helper_clone_1"));
    assert_eq!(slice_name(&slicer, "helper", 2), None);
}

#[test]
fn store_through_pointer_is_a_side_effect_for_every_location_it_may_write() {
    let mut prog = Program::new();
    let g = Value::Global(prog.add_global("g", []));
    prog.add_global("h", []);

    let f = prog.begin_function("f", Signature::new([Type::Pointer], Type::Void));
    let p = prog.argument(0);
    store(&mut prog, p.clone(), 1);
    ret(&mut prog, None);
    prog.end_function();

    prog.begin_function("main", void());
    call(&mut prog, f, vec![g.clone()]);
    prog.push(InstKind::Load { address: g });
    ret(&mut prog, None);
    prog.end_function();

    let mut pts = PointsToTable::with_direct_objects(&prog);
    for site in [global_site(0), global_site(1)] {
        let loc = pts.location_of(&site).unwrap();
        pts.add_points_to(p.clone(), loc);
    }

    let slicer = run_slicer(prog, &pts, &["f"], false).unwrap();
    let f = id(&slicer, "f");
    let mod_ref = &slicer.mod_ref;
    let f_store = find_inst(&slicer.program, "f", Opcode::Store);

    // Only `g` is read, but the store may also write `h`
    assert_eq!(mod_ref.ref_pts().len(), 1);
    assert_unorderedset_eq(mod_ref.mod_set(f).unwrap().iter().copied(), [f_store]);

    let g_write = ModInfo {
        function: f,
        site: global_site(0),
    };
    let h_write = ModInfo {
        function: f,
        site: global_site(1),
    };
    assert_eq!(
        mod_ref.side_effects(),
        &[
            SideEffect::Modifier {
                mod_info: g_write.clone(),
                slice_id: 1
            },
            SideEffect::Modifier {
                mod_info: h_write.clone(),
                slice_id: 2
            }
        ]
    );
    assert_eq!(mod_ref.mod_info_to_id_map().get(&g_write), Some(&1));
    assert_eq!(mod_ref.mod_info_to_id_map().get(&h_write), Some(&2));
    for mod_info in [&g_write, &h_write] {
        assert_unorderedset_eq(
            mod_ref.mod_info_to_store_map().get(mod_info).unwrap().iter().copied(),
            [f_store],
        );
    }

    assert_eq!(slice_name(&slicer, "f", 1).as_deref(), Some("f_clone_1"));
    assert_eq!(slice_name(&slicer, "f", 2).as_deref(), Some("f_clone_2"));
}

#[test]
fn stack_objects_of_one_function_share_its_escape_verdict() {
    let mut prog = Program::new();
    let t1 = prog.begin_function("t1", Signature::new([Type::Pointer], Type::Void));
    let p = prog.argument(0);
    store(&mut prog, p.clone(), 1);
    ret(&mut prog, None);
    prog.end_function();

    let t2 = prog.begin_function("t2", Signature::new([Type::Pointer], Type::Void));
    let q = prog.argument(0);
    store(&mut prog, q.clone(), 2);
    ret(&mut prog, None);
    prog.end_function();

    let a = prog.begin_function("a", void());
    let x = prog.push(InstKind::Alloca { size: 4 });
    let y = prog.push(InstKind::Alloca { size: 4 });
    call(&mut prog, t1, vec![x.clone()]);
    prog.push(InstKind::Load { address: x.clone() });
    prog.push(InstKind::Load { address: y.clone() });
    ret(&mut prog, None);
    prog.end_function();

    prog.begin_function("main", void());
    call(&mut prog, a, vec![]);
    call(&mut prog, t2, vec![Value::Undef]);
    ret(&mut prog, None);
    prog.end_function();

    let site = |value: &Value| AllocationSite {
        value: value.clone(),
        offset: Offset::Known(0),
    };
    let mut pts = PointsToTable::with_direct_objects(&prog);
    let x_loc = pts.location_of(&site(&x)).unwrap();
    let y_loc = pts.location_of(&site(&y)).unwrap();
    for arg in [&p, &q] {
        pts.add_points_to(arg.clone(), x_loc);
        pts.add_points_to(arg.clone(), y_loc);
    }

    let slicer = run_slicer(prog, &pts, &["t1", "t2"], false).unwrap();
    let (t1, t2) = (id(&slicer, "t1"), id(&slicer, "t2"));
    let mod_ref = &slicer.mod_ref;

    // `a` calls `t1`, so both of its slots outlive the write in `t1`
    assert_unorderedset_eq(mod_ref.mod_pts(t1).unwrap().iter().copied(), [x_loc, y_loc]);
    // `a` never reaches `t2`, so neither slot can be written by it while `a` is live
    assert!(mod_ref.mod_pts(t2).unwrap().is_empty());
    assert!(mod_ref.mod_set(t2).unwrap().is_empty());

    assert_eq!(
        mod_ref.side_effects(),
        &[
            SideEffect::Modifier {
                mod_info: ModInfo {
                    function: t1,
                    site: site(&x)
                },
                slice_id: 1
            },
            SideEffect::Modifier {
                mod_info: ModInfo {
                    function: t1,
                    site: site(&y)
                },
                slice_id: 2
            }
        ]
    );
    assert!(slicer.slice_generator.cloner().get_slices(t2).is_none());
}

#[test]
fn retained_stores_are_exactly_those_writing_read_locations() {
    let (prog, pts) = stack_escape_program();
    let slicer = run_slicer(prog, &pts, &["t", "rec_target"], false).unwrap();
    let mod_ref = &slicer.mod_ref;
    for &f in mod_ref.targets() {
        let mod_pts = mod_ref.mod_pts(f).unwrap();
        let observed = mod_pts & mod_ref.ref_pts();
        let mod_set = mod_ref.mod_set(f).unwrap();

        let mut written = UnorderedSet::new();
        for &s in mod_set.iter() {
            let address = slicer.program.instruction(s).unwrap().kind.pointer_operand().unwrap();
            let hits = &pts.resolve(address) & &observed;
            assert!(!hits.is_empty(), "{:?} writes nothing observed", s);
            written.extend(hits);
        }
        assert_eq!(written, observed);
    }
}

#[test]
fn slice_ids_are_unique_and_stable() {
    let run = || {
        let prog = indirect_call_program();
        let pts = PointsToTable::with_direct_objects(&prog);
        run_slicer(prog, &pts, &["dispatch", "inc"], false).unwrap()
    };
    let first = run();
    let second = run();
    assert_eq!(first.mod_ref.side_effects(), second.mod_ref.side_effects());

    let ids: Vec<SliceId> = first
        .mod_ref
        .side_effects()
        .iter()
        .map(|s| s.slice_id())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(first.mod_ref.mod_info_to_id_map().len(), 2);
    assert_eq!(first.mod_ref.mod_info_to_id_map(), second.mod_ref.mod_info_to_id_map());
}

#[test]
fn indirect_targets_are_sliced_with_their_caller() {
    let prog = indirect_call_program();
    let pts = PointsToTable::with_direct_objects(&prog);
    let slicer = run_slicer(prog, &pts, &["dispatch"], false).unwrap();
    assert!(slicer.program.function_by_name("lonely").is_none());

    let dispatch = id(&slicer, "dispatch");
    let counter_write = ModInfo {
        function: dispatch,
        site: global_site(0),
    };
    assert_eq!(slicer.mod_ref.ret_slice_id(dispatch), Some(1));
    assert_eq!(
        slicer.mod_ref.mod_info_to_id_map().get(&counter_write),
        Some(&2)
    );
    assert_unorderedset_eq(
        slicer
            .mod_ref
            .mod_info_to_store_map()
            .get(&counter_write)
            .unwrap()
            .iter()
            .copied(),
        [
            find_inst(&slicer.program, "inc", Opcode::Store),
            find_inst(&slicer.program, "dec", Opcode::Store),
        ],
    );
    assert_eq!(slicer.slice_generator.cloner().num_clones(), 6);
    assert_eq!(slice_name(&slicer, "inc", 2).as_deref(), Some("inc_clone_2"));
}

#[test]
fn clones_translate_back_to_their_originals() {
    let prog = indirect_call_program();
    let pts = PointsToTable::with_direct_objects(&prog);
    let slicer = run_slicer(prog, &pts, &["dispatch"], false).unwrap();
    let cloner = slicer.slice_generator.cloner();

    for original in slicer.program.functions() {
        for slice in cloner.get_slices(original.id).into_iter().flatten() {
            let translated: Vec<InstId> = slice
                .function
                .instructions()
                .map(|i| {
                    cloner
                        .translate_value(&Value::Inst(i.id))
                        .and_then(|v| v.as_inst())
                        .unwrap()
                })
                .collect();
            let distinct: UnorderedSet<InstId> = translated.iter().copied().collect();
            assert_eq!(distinct.len(), translated.len());
            assert_unorderedset_eq(distinct, original.instructions().map(|i| i.id));

            let info = cloner.get_clone_info(slice.function.id).unwrap();
            assert_eq!(info.original, original.id);
            assert_eq!(info.slice_id, slice.slice_id);

            // Operands inside the clone refer to the clone
            for ins in slice.function.instructions() {
                for v in ins.kind.operands() {
                    if let Some(i) = v.as_inst() {
                        assert_eq!(i.function, slice.function.id);
                    }
                }
            }

            let bogus = Value::Inst(InstId {
                function: slice.function.id,
                index: 1000,
            });
            assert_eq!(cloner.translate_value(&bogus), None);
        }
    }

    let main_load = Value::Inst(find_inst(&slicer.program, "main", Opcode::Load));
    assert_eq!(cloner.translate_value(&main_load), Some(main_load));
    assert_eq!(cloner.translate_value(&Value::Undef), Some(Value::Undef));
    assert_eq!(cloner.get_clone_info(id(&slicer, "main")), None);
    assert!(cloner.get_slice(id(&slicer, "dispatch"), 42).is_none());
}

#[test]
fn materialized_clone_joins_the_program() {
    let prog = call_chain_program(false);
    let pts = PointsToTable::with_direct_objects(&prog);
    let slicer = run_slicer(prog, &pts, &["a"], false).unwrap();
    let clone = slicer
        .slice_generator
        .cloner()
        .get_slice(id(&slicer, "a"), 1)
        .unwrap()
        .function
        .clone();
    let clone_id = clone.id;

    // Clones only refer to functions of the original program, so they fit in an untrimmed copy
    let mut program = call_chain_program(false);
    program.insert_function(clone.clone()).unwrap();
    assert_eq!(program.function_by_name("a_clone_1"), Some(clone_id));
    assert!(program.insert_function(clone).is_err());
}

#[test]
fn lazy_generation_waits_for_demand() {
    let prog = call_chain_program(true);
    let pts = PointsToTable::with_direct_objects(&prog);
    let mut slicer = run_slicer(prog, &pts, &["a"], true).unwrap();
    let a = id(&slicer, "a");
    let gen = &mut slicer.slice_generator;

    assert_eq!(gen.cloner().num_clones(), 4);
    assert!(gen.annotator().annotated.is_empty());
    assert!(!gen.is_sliced(a, 2));

    assert_eq!(gen.ensure_slice(a, 2), Ok(true));
    assert!(gen.is_sliced(a, 2));
    assert!(!gen.is_sliced(a, 1));
    assert_eq!(gen.ensure_slice(a, 2), Ok(true));
    assert_eq!(
        gen.annotator().annotated,
        vec![("a_clone_2".to_string(), 2, SideEffectKind::Modifier)]
    );
}

#[test]
fn failed_annotation_leaves_slice_unmarked() {
    let prog = call_chain_program(false);
    let pts = PointsToTable::with_direct_objects(&prog);
    let mut slicer = run_slicer(prog, &pts, &["a"], true).unwrap();
    let a = id(&slicer, "a");
    let gen = &mut slicer.slice_generator;

    gen.annotator_mut().failing = true;
    assert_eq!(gen.generate_slice(a, 1, SideEffectKind::Modifier), Ok(false));
    assert!(!gen.is_sliced(a, 1));
}

#[test]
fn eager_generation_annotates_each_slice_once_even_when_it_fails() {
    let prog = call_chain_program(false);
    let pts = PointsToTable::with_direct_objects(&prog);
    let config = SlicerConfig::new("main", ["a"]);
    let annotator = RecordingAnnotator {
        failing: true,
        ..Default::default()
    };
    let slicer = pipeline::run(prog, &pts, annotator, &config).unwrap();
    let a = id(&slicer, "a");

    assert_eq!(slicer.mod_ref.side_effects().len(), 1);
    assert_eq!(slicer.slice_generator.annotator().attempts, 1);
    assert!(slicer.slice_generator.annotator().annotated.is_empty());
    assert!(!slicer.slice_generator.is_sliced(a, 1));
}

#[test]
fn slices_must_exist_and_be_cloned_before_generation() {
    let prog = call_chain_program(false);
    let pts = PointsToTable::with_direct_objects(&prog);
    let mut slicer = run_slicer(prog, &pts, &["a"], true).unwrap();
    let (b, main) = (id(&slicer, "b"), id(&slicer, "main"));
    let gen = &mut slicer.slice_generator;

    assert_eq!(
        gen.ensure_slice(main, 1),
        Err(SlicerError::NoSuchSideEffect {
            function: "main".into(),
            slice_id: 1
        })
    );
    assert_eq!(
        gen.generate_slice(b, 7, SideEffectKind::Modifier),
        Err(SlicerError::SliceNotCloned {
            function: "b".into(),
            slice_id: 7
        })
    );
}

#[test]
fn configuration_errors() {
    let run = |entry: &str, targets: &[&str]| {
        let prog = call_chain_program(false);
        let pts = PointsToTable::with_direct_objects(&prog);
        let config = SlicerConfig::new(entry, targets.iter().copied());
        pipeline::run(prog, &pts, RecordingAnnotator::default(), &config).err()
    };
    assert_eq!(
        run("start", &["a"]),
        Some(SlicerError::EntryNotFound("start".into()))
    );
    assert_eq!(
        run("main", &["a", "nope"]),
        Some(SlicerError::TargetNotFound("nope".into()))
    );
    // Trimmed away as unreachable
    assert_eq!(
        run("main", &["unused"]),
        Some(SlicerError::TargetNotFound("unused".into()))
    );
    assert_eq!(
        run("main", &["a", "b", "a"]),
        Some(SlicerError::DuplicateTarget("a".into()))
    );
}

#[test]
fn recursive_slice_dump_follows_calls() {
    let prog = call_chain_program(false);
    let pts = PointsToTable::with_direct_objects(&prog);
    let slicer = run_slicer(prog, &pts, &["a"], false).unwrap();
    let a = id(&slicer, "a");

    let shallow = slicer.slice_generator.dump_slice(a, 1, false).unwrap();
    assert!(shallow.contains("a_clone_1"));
    assert!(!shallow.contains("b_clone_1"));
    let deep = slicer.slice_generator.dump_slice(a, 1, true).unwrap();
    assert!(deep.contains("a_clone_1"));
    assert!(deep.contains("b_clone_1"));
    assert_eq!(slicer.slice_generator.dump_slice(a, 9, true), None);
}

#[test]
fn diagnostics_are_logged() {
    let path = std::env::temp_dir().join(format!("slicer-log-{}.json", std::process::id()));
    let logger = crate::log::FileAndTermDrain::new(1, true, true, Some(path.clone()));

    slog_scope::scope(&logger, || {
        let prog = call_chain_program(true);
        let pts = PointsToTable::with_direct_objects(&prog);
        let mut config = SlicerConfig::new("main", ["a"]);
        config.advanced = vec![
            CommandLineSlicerConfig::DumpLoadToStoreMap,
            CommandLineSlicerConfig::DumpLoadToModInfoMap,
            CommandLineSlicerConfig::DumpModInfoToStoreMap,
            CommandLineSlicerConfig::DumpModInfoToIdMap,
            CommandLineSlicerConfig::DumpOverridingStores,
            CommandLineSlicerConfig::DumpCallGraphDot,
        ];
        let slicer = pipeline::run(prog, &pts, RecordingAnnotator::default(), &config).unwrap();
        slicer.slice_generator.dump_slices();
    });
    drop(logger);

    let log = std::fs::read_to_string(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    for msg in [
        "Mod set",
        "ret_slice_id",
        "Load to stores",
        "Mod info to id",
        "Overriding stores",
        "Call graph",
        "cloning",
        "Slice",
    ] {
        assert!(log.contains(msg), "missing {:?} in log", msg);
    }
    // Debug records stay out at this verbosity
    assert!(!log.contains("Generated slice"));
}
