pub mod bundle;
pub mod discrete_cells;
pub mod distance;
pub mod grid;
pub mod intensity;
pub mod labeling;
pub mod lineage;
pub mod linker;
pub mod optical_flow;
pub mod palette;
pub mod watershed;
