mod messages;
mod types;

pub use messages::*;
pub use types::*;
