pub mod completion;
pub mod condition;
pub mod config;
pub mod duration;
pub mod events;
pub mod grimoire;
pub mod loader;
pub mod prompt;
pub mod question;
pub mod types;

pub use config::Config;
pub use grimoire::{Grimoire, GrimoireError, Step, StepKind};
pub use loader::{BuiltinSet, Loader};
pub use question::{Detection, QuestionDetector};
pub use types::*;
