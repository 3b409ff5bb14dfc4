//! Options controlling a slicing run.
//!
//! The configuration is handed by reference to each stage of the pipeline. A host binary can
//! either parse it directly from its command line, or `#[clap(flatten)]` it into its own options.

use clap::Parser;

/// Slice a program into per-side-effect clones of its target functions
#[derive(Parser, Debug, Clone)]
pub struct SlicerConfig {
    /// Name of the function the program starts executing at
    #[clap(long, default_value = "main")]
    pub entry: String,
    /// Name of a target function whose side effects get sliced (repeat for more). The order in
    /// which targets are given determines the order in which slice ids are handed out.
    #[clap(long = "target", required = true)]
    pub targets: Vec<String>,
    /// Generate slices on first demand, rather than all up front
    #[clap(long)]
    pub lazy: bool,
    /// Advanced configuration options, mostly for debugging
    #[clap(short = 'Z', long, arg_enum)]
    pub advanced: Vec<CommandLineSlicerConfig>,
}

#[derive(clap::ArgEnum, Clone, Copy, Debug, PartialEq, Eq)]
/// Advanced slicer configuration parameters
pub enum CommandLineSlicerConfig {
    DumpLoadToStoreMap,
    DumpLoadToModInfoMap,
    DumpModInfoToStoreMap,
    DumpModInfoToIdMap,
    DumpOverridingStores,
    DumpCallGraphDot,
}

/// Which of the (otherwise silent) diagnostic dumps to log
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DumpConfig {
    pub load_to_store_map: bool,
    pub load_to_mod_info_map: bool,
    pub mod_info_to_store_map: bool,
    pub mod_info_to_id_map: bool,
    pub overriding_stores: bool,
    pub call_graph_dot: bool,
}

impl From<&[CommandLineSlicerConfig]> for DumpConfig {
    fn from(v: &[CommandLineSlicerConfig]) -> Self {
        use CommandLineSlicerConfig::*;
        let mut r = DumpConfig::default();
        for v in v {
            match v {
                DumpLoadToStoreMap => r.load_to_store_map = true,
                DumpLoadToModInfoMap => r.load_to_mod_info_map = true,
                DumpModInfoToStoreMap => r.mod_info_to_store_map = true,
                DumpModInfoToIdMap => r.mod_info_to_id_map = true,
                DumpOverridingStores => r.overriding_stores = true,
                DumpCallGraphDot => r.call_graph_dot = true,
            }
        }
        r
    }
}

impl SlicerConfig {
    /// A configuration with the given entry and targets, eager generation, and no dumps
    pub fn new(
        entry: impl Into<String>,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            entry: entry.into(),
            targets: targets.into_iter().map(Into::into).collect(),
            lazy: false,
            advanced: vec![],
        }
    }

    /// Which diagnostic dumps have been asked for
    pub fn dumps(&self) -> DumpConfig {
        DumpConfig::from(&self.advanced[..])
    }
}
