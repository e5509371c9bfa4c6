//! Record construction from caller input.

mod factory;
mod input;

pub use factory::RecordFactory;
pub use input::{LeafInput, SectionInput};
