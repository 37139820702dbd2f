//! Recurrent-layer computation engine.
//!
//! Stateful cells with hand-derived forward, backward-through-time and
//! relevance-propagation formulas, one parameter bundle per layer, and a
//! sequence processor that threads per-timestep cell instances together
//! over a reusable state pool.

pub mod activation;
mod arena;
pub mod augmented;
pub mod cells;
mod error;
pub mod layer;
pub mod optimization;
pub mod params;
pub mod processor;
pub mod relevance;

pub use activation::ActFn;
pub use augmented::AugmentedArray;
pub use cells::{Cell, CellConfig, ConnectionType, InitHidden};
pub use error::{Result, RnnError};
pub use layer::{LayerParams, RecurrentLayer};
pub use optimization::{GradientDescent, UpdateMethod};
pub use params::{ParamBundle, ParameterUnit};
pub use processor::SequenceProcessor;
