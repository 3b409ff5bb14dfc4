//! Runs the slicing stages in order over a program.

use std::rc::Rc;

use crate::cloner::Cloner;
use crate::config::SlicerConfig;
use crate::error::SlicerError;
use crate::il::Program;
use crate::log::*;
use crate::mod_ref::ModRefAnalysis;
use crate::points_to::PointsToOracle;
use crate::reachability::ReachabilityAnalysis;
use crate::slice_generator::{Annotator, SliceGenerator};

/// The results of every stage of a slicing run
pub struct Slicer<A: Annotator> {
    pub program: Rc<Program>,
    pub reachability: Rc<ReachabilityAnalysis>,
    pub mod_ref: Rc<ModRefAnalysis>,
    pub slice_generator: SliceGenerator<A>,
}

/// Trim `program` to what is reachable from the entry, find the side effects of the targets, clone
/// the code of each, and (unless lazy) hand every clone to `annotator`.
pub fn run<A: Annotator>(
    mut program: Program,
    oracle: &dyn PointsToOracle,
    annotator: A,
    config: &SlicerConfig,
) -> Result<Slicer<A>, SlicerError> {
    let reachability = ReachabilityAnalysis::run(&mut program, &config.entry)?;
    let program = Rc::new(program);
    if config.dumps().call_graph_dot {
        info!("Call graph"; "dot" => reachability.generate_dot(&program));
    }
    let reachability = Rc::new(reachability);

    let mod_ref = Rc::new(ModRefAnalysis::run(
        &program,
        &reachability,
        oracle,
        config,
    )?);
    info!("Side effects found"; "count" => mod_ref.side_effects().len());

    let cloner = Cloner::run(mod_ref.clone());
    info!("Clones made"; "count" => cloner.num_clones());

    let mut slice_generator = SliceGenerator::new(cloner, annotator, config);
    slice_generator.generate()?;

    Ok(Slicer {
        program,
        reachability,
        mod_ref,
        slice_generator,
    })
}
